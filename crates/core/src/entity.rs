//! Things with identity: two values are the same entity when their ids match,
//! whatever their other fields say.

pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    fn same_identity(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
