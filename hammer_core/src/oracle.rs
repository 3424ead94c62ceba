use crate::sandbox::Observation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of one fuzzing iteration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    Pass,
    Crash,
    Timeout,
    /// The sandbox itself failed; says nothing about the target.
    InfraError,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 4] = [
        OutcomeKind::Pass,
        OutcomeKind::Crash,
        OutcomeKind::Timeout,
        OutcomeKind::InfraError,
    ];

    /// Crashes and timeouts are persisted; passes and infra errors are only counted.
    pub fn is_interesting(&self) -> bool {
        matches!(self, OutcomeKind::Crash | OutcomeKind::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Pass => "pass",
            OutcomeKind::Crash => "crash",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::InfraError => "infra-error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outcome plus a human-readable explanation where one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub kind: OutcomeKind,
    pub detail: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            kind: OutcomeKind::Pass,
            detail: None,
        }
    }

    pub fn crash(detail: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Crash,
            detail: Some(detail.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            kind: OutcomeKind::Timeout,
            detail: None,
        }
    }

    pub fn infra_error(detail: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::InfraError,
            detail: Some(detail.into()),
        }
    }
}

/// An `Oracle` turns what the sandbox observed into an outcome.
pub trait Oracle: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, observation: &Observation) -> Verdict;
}

/// Abnormal exit is a crash, a missed deadline a timeout, anything else a pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOracle;

impl Oracle for ExitOracle {
    fn name(&self) -> &'static str {
        "exit"
    }

    fn classify(&self, observation: &Observation) -> Verdict {
        match observation {
            Observation::Response(_) => Verdict::pass(),
            Observation::Crashed(info) => Verdict::crash(info.to_string()),
            Observation::TimedOut => Verdict::timeout(),
        }
    }
}

/// [`ExitOracle`] that additionally treats a response containing any of the
/// configured patterns as a crash, for targets that report faults on stdout
/// and keep running.
#[derive(Debug, Clone)]
pub struct ResponsePatternOracle {
    patterns: Vec<String>,
}

impl ResponsePatternOracle {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }
}

impl Oracle for ResponsePatternOracle {
    fn name(&self) -> &'static str {
        "response-pattern"
    }

    fn classify(&self, observation: &Observation) -> Verdict {
        if let Observation::Response(data) = observation {
            let text = String::from_utf8_lossy(data);
            if let Some(pattern) = self.patterns.iter().find(|p| text.contains(p.as_str())) {
                return Verdict::crash(format!("response matched failure pattern '{pattern}'"));
            }
        }
        ExitOracle.classify(observation)
    }
}

/// Picks the oracle for a session: patterns switch on pattern matching.
pub fn build_oracle(failure_patterns: &[String]) -> Box<dyn Oracle> {
    if failure_patterns.is_empty() {
        Box::new(ExitOracle)
    } else {
        Box::new(ResponsePatternOracle::new(failure_patterns.to_vec()))
    }
}
