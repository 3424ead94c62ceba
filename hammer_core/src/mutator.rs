use crate::input::Input;
use crate::message::MessageLog;
use crate::mutation::LogMutation;
use rand::{Rng, RngCore, seq::IndexedRandom};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Mutator '{mutator}' has no valid mutation for this input: {reason}")]
    NoValidMutation {
        mutator: &'static str,
        reason: String,
    },
}

/// A `Mutator` inspects an input's materialized value, builds a mutation
/// whose parameters are valid for it, and returns the input extended by that
/// mutation.
///
/// Mutators never retry on their own. When no valid mutation exists they
/// return [`GenerationError`] and leave the retry policy to the generator.
pub trait Mutator<T, M>: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(
        &self,
        input: &Input<T, M>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<T, M>, GenerationError>;
}

impl<T, M, X: Mutator<T, M> + ?Sized> Mutator<T, M> for Box<X> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn generate(
        &self,
        input: &Input<T, M>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<T, M>, GenerationError> {
        (**self).generate(input, rng)
    }
}

fn no_valid(mutator: &'static str, reason: impl Into<String>) -> GenerationError {
    GenerationError::NoValidMutation {
        mutator,
        reason: reason.into(),
    }
}

fn propose_drop(log: &MessageLog, rng: &mut dyn RngCore) -> Option<LogMutation> {
    (!log.is_empty()).then(|| LogMutation::DropMessage {
        index: rng.random_range(0..log.len()),
    })
}

fn propose_reorder(log: &MessageLog, rng: &mut dyn RngCore) -> Option<LogMutation> {
    if log.len() < 2 {
        return None;
    }
    let first = rng.random_range(0..log.len());
    // Draw from the remaining len-1 slots and skip over `first`.
    let mut second = rng.random_range(0..log.len() - 1);
    if second >= first {
        second += 1;
    }
    Some(LogMutation::ReorderMessages { first, second })
}

fn propose_duplicate(log: &MessageLog, rng: &mut dyn RngCore) -> Option<LogMutation> {
    (!log.is_empty()).then(|| LogMutation::DuplicateMessage {
        index: rng.random_range(0..log.len()),
    })
}

fn propose_corrupt(log: &MessageLog, rng: &mut dyn RngCore) -> Option<LogMutation> {
    let candidates = log.non_empty_payload_indices();
    let index = *candidates.choose(&mut *rng)?;
    let payload_len = log.get(index)?.payload.len();
    Some(LogMutation::CorruptPayload {
        index,
        offset: rng.random_range(0..payload_len),
        mask: rng.random_range(1..=u8::MAX),
    })
}

/// Removes one uniformly chosen message.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropMessageMutator;

impl Mutator<MessageLog, LogMutation> for DropMessageMutator {
    fn name(&self) -> &'static str {
        "drop-message"
    }

    fn generate(
        &self,
        input: &Input<MessageLog, LogMutation>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<MessageLog, LogMutation>, GenerationError> {
        let mutation = propose_drop(&input.value(), rng)
            .ok_or_else(|| no_valid(self.name(), "cannot drop from an empty message log"))?;
        Ok(input.mutate(mutation))
    }
}

/// Swaps the contents of two distinct messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReorderMessagesMutator;

impl Mutator<MessageLog, LogMutation> for ReorderMessagesMutator {
    fn name(&self) -> &'static str {
        "reorder-messages"
    }

    fn generate(
        &self,
        input: &Input<MessageLog, LogMutation>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<MessageLog, LogMutation>, GenerationError> {
        let mutation = propose_reorder(&input.value(), rng)
            .ok_or_else(|| no_valid(self.name(), "reordering needs at least two messages"))?;
        Ok(input.mutate(mutation))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DuplicateMessageMutator;

impl Mutator<MessageLog, LogMutation> for DuplicateMessageMutator {
    fn name(&self) -> &'static str {
        "duplicate-message"
    }

    fn generate(
        &self,
        input: &Input<MessageLog, LogMutation>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<MessageLog, LogMutation>, GenerationError> {
        let mutation = propose_duplicate(&input.value(), rng)
            .ok_or_else(|| no_valid(self.name(), "cannot duplicate from an empty message log"))?;
        Ok(input.mutate(mutation))
    }
}

/// XORs one byte of one non-empty payload with a non-zero mask, so the
/// resulting payload always differs from the original.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorruptPayloadMutator;

impl Mutator<MessageLog, LogMutation> for CorruptPayloadMutator {
    fn name(&self) -> &'static str {
        "corrupt-payload"
    }

    fn generate(
        &self,
        input: &Input<MessageLog, LogMutation>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<MessageLog, LogMutation>, GenerationError> {
        let mutation = propose_corrupt(&input.value(), rng)
            .ok_or_else(|| no_valid(self.name(), "no message carries a payload byte"))?;
        Ok(input.mutate(mutation))
    }
}

/// Havoc strategy: picks uniformly among the log mutation kinds that are
/// applicable to the current value, then builds that kind of mutation.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyLogMutator;

type Proposer = fn(&MessageLog, &mut dyn RngCore) -> Option<LogMutation>;

impl Mutator<MessageLog, LogMutation> for AnyLogMutator {
    fn name(&self) -> &'static str {
        "havoc"
    }

    fn generate(
        &self,
        input: &Input<MessageLog, LogMutation>,
        rng: &mut dyn RngCore,
    ) -> Result<Input<MessageLog, LogMutation>, GenerationError> {
        let log = input.value();
        let mut applicable: Vec<Proposer> = Vec::with_capacity(4);
        if !log.is_empty() {
            applicable.push(propose_drop);
            applicable.push(propose_duplicate);
        }
        if log.len() >= 2 {
            applicable.push(propose_reorder);
        }
        if !log.non_empty_payload_indices().is_empty() {
            applicable.push(propose_corrupt);
        }

        let propose = applicable
            .choose(&mut *rng)
            .copied()
            .ok_or_else(|| no_valid(self.name(), "no mutation kind applies to an empty message log"))?;
        let mutation = propose(&log, rng)
            .ok_or_else(|| no_valid(self.name(), "selected mutation kind produced no mutation"))?;
        Ok(input.mutate(mutation))
    }
}

/// Mutator selection as written in session configuration and on the command line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutatorKind {
    DropMessage,
    ReorderMessages,
    DuplicateMessage,
    CorruptPayload,
    #[default]
    Havoc,
}

impl MutatorKind {
    pub const ALL: [MutatorKind; 5] = [
        MutatorKind::DropMessage,
        MutatorKind::ReorderMessages,
        MutatorKind::DuplicateMessage,
        MutatorKind::CorruptPayload,
        MutatorKind::Havoc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutatorKind::DropMessage => "drop-message",
            MutatorKind::ReorderMessages => "reorder-messages",
            MutatorKind::DuplicateMessage => "duplicate-message",
            MutatorKind::CorruptPayload => "corrupt-payload",
            MutatorKind::Havoc => "havoc",
        }
    }
}

impl fmt::Display for MutatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MutatorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = MutatorKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown mutator '{s}', expected one of: {}", known.join(", "))
            })
    }
}

pub fn build_mutator(kind: MutatorKind) -> Box<dyn Mutator<MessageLog, LogMutation>> {
    match kind {
        MutatorKind::DropMessage => Box::new(DropMessageMutator),
        MutatorKind::ReorderMessages => Box::new(ReorderMessagesMutator),
        MutatorKind::DuplicateMessage => Box::new(DuplicateMessageMutator),
        MutatorKind::CorruptPayload => Box::new(CorruptPayloadMutator),
        MutatorKind::Havoc => Box::new(AnyLogMutator),
    }
}
