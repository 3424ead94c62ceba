use crate::config::{ConfigError, HammerConfig};
use crate::fuzzer::{FuzzOptions, Fuzzer};
use crate::generator::FixedInputGenerator;
use crate::input::{Input, Seed};
use crate::message::MessageLog;
use crate::mutation::{LogMutation, from_record};
use crate::oracle::{OutcomeKind, Verdict, build_oracle};
use crate::sandbox::SandboxRuntime;
use crate::seeds::{SeedError, load_seed_pool};
use crate::store::{InterestingInputRecord, StoreError, fingerprint};
use log::{info, warn};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Record refers to seed '{0}', which is not in the seed pool")]
    UnknownSeed(String),
    #[error("Mutation #{position} in the recorded chain cannot be rebuilt: {source}")]
    Mutation {
        position: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Seeds(#[from] SeedError),
}

/// Rebuilds the input a record describes by folding its chain over the
/// referenced seed.
pub fn rebuild_input<T, M>(
    record: &InterestingInputRecord,
    seeds: &[Arc<Seed<T>>],
) -> Result<Input<T, M>, ReplayError>
where
    M: DeserializeOwned,
{
    let seed = seeds
        .iter()
        .find(|seed| seed.reference() == record.seed_reference)
        .ok_or_else(|| ReplayError::UnknownSeed(record.seed_reference.clone()))?;

    if fingerprint(&record.seed_reference, &record.mutation_chain)? != record.fingerprint {
        warn!(
            "Record {} does not match its own fingerprint, it may have been edited",
            record.key()
        );
    }

    let mut input = Input::new(Arc::clone(seed));
    for (position, entry) in record.mutation_chain.iter().enumerate() {
        let mutation: M =
            from_record(entry).map_err(|source| ReplayError::Mutation { position, source })?;
        input = input.mutate(mutation);
    }
    Ok(input)
}

/// Result of running a recorded input once more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub expected: OutcomeKind,
    pub verdict: Verdict,
}

impl ReplayOutcome {
    pub fn reproduced(&self) -> bool {
        self.verdict.kind == self.expected
    }
}

/// Runs a recorded input against the configured app and reports whether the
/// recorded outcome happened again.
pub fn replay_record(
    config: &HammerConfig,
    record: &InterestingInputRecord,
    runtime: Arc<dyn SandboxRuntime>,
) -> Result<ReplayOutcome, ReplayError> {
    config.validate()?;
    let session = &config.session;
    if !record.app.is_empty() && record.app != session.app {
        warn!(
            "Record was found against app '{}', replaying against '{}'",
            record.app, session.app
        );
    }

    let seeds = load_seed_pool(&session.seeds)?;
    let input: Input<MessageLog, LogMutation> = rebuild_input(record, &seeds)?;
    info!(
        "Replaying {} ({} mutation(s) over {})",
        record.key(),
        input.chain_len(),
        record.seed_reference
    );

    let fuzzer = Fuzzer::new(
        session.app.clone(),
        config.app()?.clone(),
        runtime,
        Box::new(FixedInputGenerator::new(Vec::new())),
        FuzzOptions::from_settings(session),
    )
    .with_oracle(build_oracle(&session.failure_patterns));

    Ok(ReplayOutcome {
        expected: record.outcome,
        verdict: fuzzer.run_single(&input),
    })
}
