pub mod app;
pub mod config;
pub mod fuzzer;
pub mod generator;
pub mod input;
pub mod message;
pub mod mutation;
pub mod mutator;
pub mod oracle;
pub mod replay;
pub mod sandbox;
pub mod seeds;
pub mod store;

pub use app::{App, AppRegistry, LaunchConfig, Mount};
pub use config::{ConfigError, HammerConfig, SessionSettings};
pub use fuzzer::{
    AbortReason, Budget, FuzzOptions, Fuzzer, FuzzerError, OutcomeCounts, ResourceUsage,
    SessionExit, SessionReport, StopHandle, default_runtime,
};
pub use generator::{
    FixedInputGenerator, GeneratorError, InputGenerator, MultiOrderInputGenerator,
    RandomInputGenerator,
};
pub use input::{Input, Seed};
pub use message::{Injectable, LogRecord, MessageLog, PayloadFormat};
pub use mutation::{LogMutation, Mutation, MutationRecord};
pub use mutator::{GenerationError, Mutator, MutatorKind, build_mutator};
pub use oracle::{ExitOracle, Oracle, OutcomeKind, ResponsePatternOracle, Verdict};
pub use replay::{ReplayError, ReplayOutcome, rebuild_input, replay_record};
pub use sandbox::{AppInstance, Observation, SandboxError, SandboxRuntime};
pub use seeds::{SeedError, load_seed_log, load_seed_pool, write_seed_log};
pub use store::{
    InMemoryRecordStore, InterestingInputRecord, OnDiskRecordStore, RecordStore, StoreError,
};
