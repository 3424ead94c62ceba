use crate::input::{Input, Seed};
use crate::mutation::Mutation;
use crate::mutator::{GenerationError, Mutator};
use log::{debug, trace};
use rand_core::SeedableRng;
use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: usize = 8;
pub const DEFAULT_MAX_SKIPPED_PULLS: usize = 16;

/// Errors that end generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// The generator was built over an empty seed pool.
    #[error("Seed pool is empty, nothing to generate from")]
    NoSeeds,
    /// Every retry failed before a single input was ever produced.
    #[error("Generator exhausted after {attempts} attempts without producing any input: {last}")]
    Exhausted {
        attempts: usize,
        last: GenerationError,
    },
}

/// Generation strategy as named in session configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorKind {
    #[default]
    Random,
    MultiOrder,
}

/// Retry bounds shared by the seed-pool generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorLimits {
    /// Extra attempts, each on a freshly drawn seed, after a pull's first attempt fails.
    pub max_retries: usize,
    /// Consecutive failed pulls tolerated once at least one input was produced.
    /// One more ends the stream.
    pub max_skipped_pulls: usize,
}

impl Default for GeneratorLimits {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_skipped_pulls: DEFAULT_MAX_SKIPPED_PULLS,
        }
    }
}

/// A lazy source of inputs.
///
/// `Ok(None)` marks the end of the stream. Seed-pool generators are logically
/// infinite and only return it after repeated failed pulls; finite generators
/// return it once their inputs run out. A generator never restarts on its own,
/// only through [`InputGenerator::reseed`].
pub trait InputGenerator<T, M>: Send {
    fn name(&self) -> &'static str;

    fn next_input(&mut self) -> Result<Option<Input<T, M>>, GeneratorError>;

    /// Number of inputs handed out since construction or the last reseed.
    fn produced(&self) -> u64;

    /// Restarts the sequence from a new random seed.
    fn reseed(&mut self, seed: u64);
}

impl<T, M, G: InputGenerator<T, M> + ?Sized> InputGenerator<T, M> for Box<G> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn next_input(&mut self) -> Result<Option<Input<T, M>>, GeneratorError> {
        (**self).next_input()
    }

    fn produced(&self) -> u64 {
        (**self).produced()
    }

    fn reseed(&mut self, seed: u64) {
        (**self).reseed(seed)
    }
}

/// State shared by [`RandomInputGenerator`] and [`MultiOrderInputGenerator`]:
/// the seed pool, the mutator, and the pull/retry policy.
struct SeedPoolPuller<T, M> {
    seeds: Vec<Arc<Seed<T>>>,
    mutator: Box<dyn Mutator<T, M>>,
    rng: ChaCha8Rng,
    limits: GeneratorLimits,
    produced: u64,
}

impl<T, M> SeedPoolPuller<T, M>
where
    T: Clone,
    M: Mutation<T>,
{
    fn new(
        seeds: Vec<Arc<Seed<T>>>,
        mutator: Box<dyn Mutator<T, M>>,
        random_seed: u64,
        limits: GeneratorLimits,
    ) -> Result<Self, GeneratorError> {
        if seeds.is_empty() {
            return Err(GeneratorError::NoSeeds);
        }
        Ok(Self {
            seeds,
            mutator,
            rng: ChaCha8Rng::seed_from_u64(random_seed),
            limits,
            produced: 0,
        })
    }

    /// Back to a fresh stream: nothing counts as produced before the restart.
    fn restart(&mut self, random_seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(random_seed);
        self.produced = 0;
    }

    /// One attempt: a uniformly drawn seed, then `order` successive mutator calls.
    fn attempt(&mut self, order: usize) -> Result<Input<T, M>, GenerationError> {
        let seed = self
            .seeds
            .choose(&mut self.rng)
            .cloned()
            .ok_or_else(|| GenerationError::NoValidMutation {
                mutator: self.mutator.name(),
                reason: "seed pool is empty".to_string(),
            })?;
        let mut input = Input::new(seed);
        for _ in 0..order {
            input = self.mutator.generate(&input, &mut self.rng)?;
        }
        Ok(input)
    }

    fn pull(&mut self, order: usize) -> Result<Option<Input<T, M>>, GeneratorError> {
        let attempts = self.limits.max_retries + 1;
        let mut skipped = 0;
        loop {
            let mut last = None;
            for attempt in 0..attempts {
                match self.attempt(order) {
                    Ok(input) => {
                        self.produced += 1;
                        return Ok(Some(input));
                    }
                    Err(err) => {
                        trace!("Attempt {} of {} failed: {}", attempt + 1, attempts, err);
                        last = Some(err);
                    }
                }
            }
            let Some(last) = last else {
                // Only reachable with zero attempts, which `attempts >= 1` rules out.
                return Ok(None);
            };

            if self.produced == 0 {
                return Err(GeneratorError::Exhausted { attempts, last });
            }
            skipped += 1;
            if skipped > self.limits.max_skipped_pulls {
                debug!(
                    "Ending input stream after {} consecutive failed pulls ({})",
                    skipped, last
                );
                return Ok(None);
            }
            debug!("Skipping pull after {} failed attempts: {}", attempts, last);
        }
    }
}

/// Picks a random seed and applies exactly one mutation per produced input.
pub struct RandomInputGenerator<T, M> {
    puller: SeedPoolPuller<T, M>,
}

impl<T, M> RandomInputGenerator<T, M>
where
    T: Clone,
    M: Mutation<T>,
{
    pub fn new(
        seeds: Vec<Arc<Seed<T>>>,
        mutator: Box<dyn Mutator<T, M>>,
        random_seed: u64,
    ) -> Result<Self, GeneratorError> {
        Self::with_limits(seeds, mutator, random_seed, GeneratorLimits::default())
    }

    pub fn with_limits(
        seeds: Vec<Arc<Seed<T>>>,
        mutator: Box<dyn Mutator<T, M>>,
        random_seed: u64,
        limits: GeneratorLimits,
    ) -> Result<Self, GeneratorError> {
        Ok(Self {
            puller: SeedPoolPuller::new(seeds, mutator, random_seed, limits)?,
        })
    }
}

impl<T, M> InputGenerator<T, M> for RandomInputGenerator<T, M>
where
    T: Clone + Send + Sync,
    M: Mutation<T>,
{
    fn name(&self) -> &'static str {
        "random"
    }

    fn next_input(&mut self) -> Result<Option<Input<T, M>>, GeneratorError> {
        self.puller.pull(1)
    }

    fn produced(&self) -> u64 {
        self.puller.produced
    }

    fn reseed(&mut self, seed: u64) {
        self.puller.restart(seed);
    }
}

/// Like [`RandomInputGenerator`], but runs the mutator `order` times on the
/// drawn seed, producing inputs whose chains are `order` mutations long.
pub struct MultiOrderInputGenerator<T, M> {
    puller: SeedPoolPuller<T, M>,
    order: usize,
}

impl<T, M> MultiOrderInputGenerator<T, M>
where
    T: Clone,
    M: Mutation<T>,
{
    pub fn new(
        seeds: Vec<Arc<Seed<T>>>,
        mutator: Box<dyn Mutator<T, M>>,
        order: usize,
        random_seed: u64,
        limits: GeneratorLimits,
    ) -> Result<Self, GeneratorError> {
        Ok(Self {
            puller: SeedPoolPuller::new(seeds, mutator, random_seed, limits)?,
            order: order.max(1),
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }
}

impl<T, M> InputGenerator<T, M> for MultiOrderInputGenerator<T, M>
where
    T: Clone + Send + Sync,
    M: Mutation<T>,
{
    fn name(&self) -> &'static str {
        "multi-order"
    }

    fn next_input(&mut self) -> Result<Option<Input<T, M>>, GeneratorError> {
        self.puller.pull(self.order)
    }

    fn produced(&self) -> u64 {
        self.puller.produced
    }

    fn reseed(&mut self, seed: u64) {
        self.puller.restart(seed);
    }
}

/// Yields a fixed list of inputs once, in order. Used to replay recorded inputs.
pub struct FixedInputGenerator<T, M> {
    inputs: Vec<Input<T, M>>,
    pending: VecDeque<Input<T, M>>,
    produced: u64,
}

impl<T, M> FixedInputGenerator<T, M> {
    pub fn new(inputs: Vec<Input<T, M>>) -> Self {
        Self {
            pending: inputs.iter().cloned().collect(),
            inputs,
            produced: 0,
        }
    }
}

impl<T, M> InputGenerator<T, M> for FixedInputGenerator<T, M>
where
    T: Send + Sync,
    M: Send + Sync,
{
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn next_input(&mut self) -> Result<Option<Input<T, M>>, GeneratorError> {
        let next = self.pending.pop_front();
        if next.is_some() {
            self.produced += 1;
        }
        Ok(next)
    }

    fn produced(&self) -> u64 {
        self.produced
    }

    /// Rewinds to the first input; the seed value is irrelevant.
    fn reseed(&mut self, _seed: u64) {
        self.pending = self.inputs.iter().cloned().collect();
        self.produced = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageLog;
    use crate::message::test_utils::labelled_log;
    use crate::mutation::LogMutation;
    use crate::mutator::DropMessageMutator;
    use rand::RngCore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seed(reference: &str, labels: &[&str]) -> Arc<Seed<MessageLog>> {
        Arc::new(Seed::new(reference, labelled_log(labels)))
    }

    /// Delegates to `DropMessageMutator` for the first `budget` calls, then always fails.
    #[derive(Debug)]
    struct SucceedThenFail {
        budget: AtomicUsize,
    }

    impl Mutator<MessageLog, LogMutation> for SucceedThenFail {
        fn name(&self) -> &'static str {
            "succeed-then-fail"
        }

        fn generate(
            &self,
            input: &Input<MessageLog, LogMutation>,
            rng: &mut dyn RngCore,
        ) -> Result<Input<MessageLog, LogMutation>, GenerationError> {
            let remaining = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match remaining {
                Ok(_) => DropMessageMutator.generate(input, rng),
                Err(_) => Err(GenerationError::NoValidMutation {
                    mutator: self.name(),
                    reason: "budget spent".to_string(),
                }),
            }
        }
    }

    #[test]
    fn empty_seed_pool_is_rejected() {
        let result = RandomInputGenerator::<MessageLog, LogMutation>::new(
            Vec::new(),
            Box::new(DropMessageMutator),
            1,
        );
        assert!(matches!(result, Err(GeneratorError::NoSeeds)));
    }

    #[test]
    fn empty_seed_is_retried_with_another_seed() {
        let seeds = vec![seed("empty", &[]), seed("full", &["A", "B", "C"])];
        let limits = GeneratorLimits {
            max_retries: 64,
            ..GeneratorLimits::default()
        };
        let mut generator =
            RandomInputGenerator::with_limits(seeds, Box::new(DropMessageMutator), 42, limits)
                .unwrap();

        for _ in 0..50 {
            let input = generator.next_input().unwrap().unwrap();
            assert_eq!(input.seed().reference(), "full");
            assert_eq!(input.chain_len(), 1);
            assert_eq!(input.value().len(), 2);
        }
        assert_eq!(generator.produced(), 50);
    }

    #[test]
    fn exhaustion_before_first_input_is_an_error() {
        let seeds = vec![seed("empty-a", &[]), seed("empty-b", &[])];
        let limits = GeneratorLimits {
            max_retries: 3,
            max_skipped_pulls: 5,
        };
        let mut generator =
            RandomInputGenerator::with_limits(seeds, Box::new(DropMessageMutator), 0, limits)
                .unwrap();

        match generator.next_input() {
            Err(GeneratorError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(generator.produced(), 0);
    }

    #[test]
    fn exhaustion_after_first_input_ends_the_stream() {
        let mutator = SucceedThenFail {
            budget: AtomicUsize::new(1),
        };
        let limits = GeneratorLimits {
            max_retries: 2,
            max_skipped_pulls: 3,
        };
        let mut generator = RandomInputGenerator::with_limits(
            vec![seed("seed", &["A", "B"])],
            Box::new(mutator),
            9,
            limits,
        )
        .unwrap();

        assert!(generator.next_input().unwrap().is_some());
        assert!(generator.next_input().unwrap().is_none());
        assert_eq!(generator.produced(), 1);
    }

    #[test]
    fn multi_order_applies_mutator_order_times() {
        let mut generator = MultiOrderInputGenerator::new(
            vec![seed("seed", &["A", "B", "C", "D"])],
            Box::new(DropMessageMutator),
            3,
            5,
            GeneratorLimits::default(),
        )
        .unwrap();
        let input = generator.next_input().unwrap().unwrap();
        assert_eq!(input.chain_len(), 3);
        assert_eq!(input.value().len(), 1);
    }

    #[test]
    fn same_random_seed_yields_same_chains() {
        let make = || {
            MultiOrderInputGenerator::new(
                vec![seed("a", &["A", "B", "C"]), seed("b", &["X", "Y", "Z"])],
                Box::new(DropMessageMutator),
                2,
                1234,
                GeneratorLimits::default(),
            )
            .unwrap()
        };
        let (mut left, mut right) = (make(), make());
        for _ in 0..20 {
            let l = left.next_input().unwrap().unwrap();
            let r = right.next_input().unwrap().unwrap();
            assert_eq!(l.seed().reference(), r.seed().reference());
            assert_eq!(l.mutations(), r.mutations());
        }
    }

    #[test]
    fn reseed_restarts_the_sequence() {
        let mut generator = RandomInputGenerator::new(
            vec![seed("a", &["A", "B", "C", "D", "E"])],
            Box::new(DropMessageMutator),
            77,
        )
        .unwrap();
        let first: Vec<LogMutation> = (0..10)
            .map(|_| *generator.next_input().unwrap().unwrap().mutations()[0])
            .collect();
        generator.reseed(77);
        let second: Vec<LogMutation> = (0..10)
            .map(|_| *generator.next_input().unwrap().unwrap().mutations()[0])
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn exhaustion_right_after_reseed_is_an_error() {
        let mutator = SucceedThenFail {
            budget: AtomicUsize::new(1),
        };
        let limits = GeneratorLimits {
            max_retries: 1,
            max_skipped_pulls: 0,
        };
        let mut generator = RandomInputGenerator::with_limits(
            vec![seed("seed", &["A", "B"])],
            Box::new(mutator),
            3,
            limits,
        )
        .unwrap();

        assert!(generator.next_input().unwrap().is_some());
        generator.reseed(1);
        assert_eq!(generator.produced(), 0);
        assert!(matches!(
            generator.next_input(),
            Err(GeneratorError::Exhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn fixed_generator_yields_each_input_once() {
        let base = Input::<MessageLog, LogMutation>::new(seed("a", &["A", "B"]));
        let inputs = vec![
            base.mutate(LogMutation::DropMessage { index: 0 }),
            base.mutate(LogMutation::DropMessage { index: 1 }),
        ];
        let mut generator = FixedInputGenerator::new(inputs);
        assert!(generator.next_input().unwrap().is_some());
        assert!(generator.next_input().unwrap().is_some());
        assert!(generator.next_input().unwrap().is_none());
        assert_eq!(generator.produced(), 2);
        generator.reseed(0);
        assert!(generator.next_input().unwrap().is_some());
        assert_eq!(generator.produced(), 1);
    }
}
