//! The live object list of a tile: class -> objects in creation order.

use std::collections::BTreeMap;

use crate::class_id::ClassId;
use crate::object::{Object, ObjectId};

/// Objects grouped by class.
///
/// Each object is indexed under exactly one class, the one in its
/// [`Object::class_id`]. Within a class, iteration yields objects in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    classes: BTreeMap<ClassId, Vec<Object>>,
}

impl ObjectList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object under its own class.
    pub fn push(&mut self, object: Object) {
        self.classes.entry(object.class_id()).or_default().push(object);
    }

    /// Append many objects.
    pub fn extend(&mut self, objects: impl IntoIterator<Item = Object>) {
        for object in objects {
            self.push(object);
        }
    }

    /// Objects of one class (empty if the class has none).
    #[must_use]
    pub fn class(&self, class_id: ClassId) -> &[Object] {
        self.classes.get(&class_id).map_or(&[], Vec::as_slice)
    }

    /// Mutable objects of one class.
    ///
    /// Callers must not change [`Object::class_id`] through this slice;
    /// take the object out with
    /// [`take_matching`](Self::take_matching) and push it back instead.
    pub fn class_mut(&mut self, class_id: ClassId) -> &mut [Object] {
        self.classes
            .get_mut(&class_id)
            .map_or(&mut [], Vec::as_mut_slice)
    }

    /// Remove and return every object of a class.
    pub fn take_class(&mut self, class_id: ClassId) -> Vec<Object> {
        self.classes.remove(&class_id).unwrap_or_default()
    }

    /// Number of objects in a class.
    #[must_use]
    pub fn count(&self, class_id: ClassId) -> usize {
        self.classes.get(&class_id).map_or(0, Vec::len)
    }

    /// Total number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.values().map(Vec::len).sum()
    }

    /// Returns `true` if the list holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.values().all(Vec::is_empty)
    }

    /// Classes that currently hold objects, ascending.
    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.classes
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(c, _)| *c)
    }

    /// Every object, class by class, in creation order within a class.
    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.classes.values().flatten()
    }

    /// Look up an object by id.
    #[must_use]
    pub fn find(&self, id: ObjectId) -> Option<&Object> {
        self.iter().find(|o| o.id() == id)
    }

    /// Mutable lookup by id.
    pub fn find_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.classes.values_mut().flatten().find(|o| o.id() == id)
    }

    /// Remove every object matching `pred`, one pass per class.
    ///
    /// Returned objects keep their class-then-insertion order.
    pub fn take_matching(&mut self, mut pred: impl FnMut(&Object) -> bool) -> Vec<Object> {
        let mut taken = Vec::new();
        for objects in self.classes.values_mut() {
            let (matched, kept): (Vec<_>, Vec<_>) =
                std::mem::take(objects).into_iter().partition(|o| pred(o));
            *objects = kept;
            taken.extend(matched);
        }
        self.classes.retain(|_, objects| !objects.is_empty());
        taken
    }

    /// Remove an object by id.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let (class_id, index) = self.classes.iter().find_map(|(c, objects)| {
            objects.iter().position(|o| o.id() == id).map(|i| (*c, i))
        })?;
        let objects = self.classes.get_mut(&class_id)?;
        let object = objects.remove(index);
        if objects.is_empty() {
            self.classes.remove(&class_id);
        }
        Some(object)
    }

    /// Drop every `TEMP_*` class.
    pub fn clear_temp(&mut self) {
        self.classes.retain(|class_id, _| !class_id.is_temp());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::TempSlot;
    use crate::object::tests::square;

    #[test]
    fn class_iteration_is_insertion_ordered() {
        let mut list = ObjectList::new();
        list.push(square(3, 1, 0, 0, 2));
        list.push(square(1, 1, 4, 4, 2));
        list.push(square(2, 1, 8, 8, 2));
        let ids: Vec<u64> = list.class(ClassId::new(1)).iter().map(|o| o.id().get()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn missing_class_is_empty() {
        let list = ObjectList::new();
        assert!(list.class(ClassId::new(42)).is_empty());
        assert_eq!(list.count(ClassId::new(42)), 0);
    }

    #[test]
    fn take_matching_spans_classes_in_order() {
        let mut list = ObjectList::new();
        list.push(square(7, 2, 0, 0, 3));
        list.push(square(3, 1, 4, 4, 2));
        list.push(square(5, 1, 8, 8, 2));
        list.push(square(4, 1, 12, 12, 2));
        let taken = list.take_matching(|o| o.id().get() != 5);
        let ids: Vec<u64> = taken.iter().map(|o| o.id().get()).collect();
        assert_eq!(ids, vec![3, 4, 7]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.class_ids().collect::<Vec<_>>(), [ClassId::new(1)]);
        assert!(list.take_matching(|_| false).is_empty());
    }

    #[test]
    fn clear_temp_keeps_user_classes() {
        let mut list = ObjectList::new();
        list.push(square(1, 1, 0, 0, 2));
        let mut temp = square(2, 1, 3, 3, 2);
        temp.set_class(TempSlot::Temp01.class_id());
        list.push(temp);
        list.clear_temp();
        assert_eq!(list.len(), 1);
        assert!(list.find(ObjectId::new(2)).is_none());
    }

    #[test]
    fn remove_drops_empty_class() {
        let mut list = ObjectList::new();
        list.push(square(1, 4, 0, 0, 2));
        assert!(list.remove(ObjectId::new(1)).is_some());
        assert!(list.is_empty());
        assert_eq!(list.class_ids().count(), 0);
    }
}
