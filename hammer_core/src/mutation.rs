use crate::message::MessageLog;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

/// A named, parameterized transform over values of type `T`.
///
/// Implementations must be referentially transparent: the same parameters
/// applied to equal values always produce equal results, with no hidden
/// randomness and no side effects. `apply` borrows its argument and must
/// never modify it in place. Reproducing a failure by replaying a recorded
/// chain depends on this.
pub trait Mutation<T>: fmt::Debug + Send + Sync {
    /// Stable identifier written into persisted mutation chains.
    fn name(&self) -> &'static str;

    fn apply(&self, value: &T) -> T;
}

impl<T, X: Mutation<T> + ?Sized> Mutation<T> for Box<X> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn apply(&self, value: &T) -> T {
        (**self).apply(value)
    }
}

/// The persisted form of a single mutation: its name and its parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Serializes a mutation into its `(name, params)` record.
///
/// Mutation types are expected to serialize adjacently tagged as
/// `{"name": ..., "params": {...}}`, which [`LogMutation`] does.
pub fn to_record<M: Serialize>(mutation: &M) -> Result<MutationRecord, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(mutation)?)
}

/// Rebuilds a mutation from its persisted record.
pub fn from_record<M: DeserializeOwned>(record: &MutationRecord) -> Result<M, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(record)?)
}

/// Mutations over a [`MessageLog`].
///
/// Parameters are chosen by a mutator that has inspected the value; see
/// `crate::mutator`. When parameters do not fit the value (for instance a
/// hand-edited replay record) the log is returned unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "name", content = "params", rename_all = "kebab-case")]
pub enum LogMutation {
    DropMessage { index: usize },
    ReorderMessages { first: usize, second: usize },
    DuplicateMessage { index: usize },
    CorruptPayload { index: usize, offset: usize, mask: u8 },
}

impl Mutation<MessageLog> for LogMutation {
    fn name(&self) -> &'static str {
        match self {
            LogMutation::DropMessage { .. } => "drop-message",
            LogMutation::ReorderMessages { .. } => "reorder-messages",
            LogMutation::DuplicateMessage { .. } => "duplicate-message",
            LogMutation::CorruptPayload { .. } => "corrupt-payload",
        }
    }

    fn apply(&self, log: &MessageLog) -> MessageLog {
        match *self {
            LogMutation::DropMessage { index } => log.without(index),
            LogMutation::ReorderMessages { first, second } => log.with_swapped(first, second),
            LogMutation::DuplicateMessage { index } => log.with_duplicate(index),
            LogMutation::CorruptPayload {
                index,
                offset,
                mask,
            } => log.with_corrupted_payload(index, offset, mask),
        }
    }
}
