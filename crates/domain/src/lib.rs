//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod action;
mod party;

pub use action::{
    ACTION_UID_LENGTH, Action, ActionInput, ActionStatus, ActionUid, PropertyChange,
};
pub use party::{ActionParty, Entity, EntityRef, EntityType, ResolvedParty, Service};
