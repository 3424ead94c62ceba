use crate::mutation::Mutation;
use std::fmt;
use std::sync::Arc;

/// An unmutated value together with the reference it was loaded from.
///
/// The reference (typically the seed file path) is what persisted records
/// point back to, so it must identify the seed across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed<T> {
    reference: String,
    value: T,
}

impl<T> Seed<T> {
    pub fn new(reference: impl Into<String>, value: T) -> Self {
        Self {
            reference: reference.into(),
            value,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

/// One link of a persistent mutation chain. Links are shared between every
/// input derived from the same prefix.
struct ChainLink<M> {
    mutation: M,
    parent: Option<Arc<ChainLink<M>>>,
}

/// An immutable fuzzing input: a seed plus an ordered chain of mutations.
///
/// The chain is a persistent list: [`Input::mutate`] allocates a single link
/// pointing at the current tail, so appending is O(1) regardless of depth and
/// sibling inputs share their common prefix without copying it.
///
/// The concrete value is never cached. [`Input::value`] replays the whole
/// chain over the seed on every call.
pub struct Input<T, M> {
    seed: Arc<Seed<T>>,
    tail: Option<Arc<ChainLink<M>>>,
    len: usize,
}

impl<T, M> Input<T, M> {
    /// Wraps a seed as a zero-mutation input.
    pub fn new(seed: Arc<Seed<T>>) -> Self {
        Self {
            seed,
            tail: None,
            len: 0,
        }
    }

    pub fn seed(&self) -> &Arc<Seed<T>> {
        &self.seed
    }

    pub fn chain_len(&self) -> usize {
        self.len
    }

    /// Returns a new input whose chain is this chain followed by `mutation`.
    /// `self` is left untouched.
    pub fn mutate(&self, mutation: M) -> Self {
        Self {
            seed: Arc::clone(&self.seed),
            tail: Some(Arc::new(ChainLink {
                mutation,
                parent: self.tail.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// The mutation chain, oldest first.
    pub fn mutations(&self) -> Vec<&M> {
        let mut chain = Vec::with_capacity(self.len);
        let mut cursor = self.tail.as_deref();
        while let Some(link) = cursor {
            chain.push(&link.mutation);
            cursor = link.parent.as_deref();
        }
        chain.reverse();
        chain
    }
}

impl<T: Clone, M: Mutation<T>> Input<T, M> {
    /// Materializes the input by folding the chain over the seed, in order.
    pub fn value(&self) -> T {
        self.mutations()
            .into_iter()
            .fold(self.seed.value().clone(), |value, mutation| {
                mutation.apply(&value)
            })
    }
}

impl<T, M> Clone for Input<T, M> {
    fn clone(&self) -> Self {
        Self {
            seed: Arc::clone(&self.seed),
            tail: self.tail.clone(),
            len: self.len,
        }
    }
}

impl<T, M> Drop for Input<T, M> {
    // Unlinks uniquely-owned links one at a time so long chains do not
    // recurse through nested `Arc` drops.
    fn drop(&mut self) {
        let mut next = self.tail.take();
        while let Some(link) = next {
            match Arc::try_unwrap(link) {
                Ok(mut owned) => next = owned.parent.take(),
                Err(_) => break,
            }
        }
    }
}

impl<T, M: Mutation<T>> fmt::Debug for Input<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("seed", &self.seed.reference())
            .field("chain", &self.mutations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageLog;
    use crate::message::test_utils::{labelled_log, payload_labels};
    use crate::mutation::LogMutation;

    #[derive(Debug)]
    struct AddN(i64);

    impl Mutation<i64> for AddN {
        fn name(&self) -> &'static str {
            "add-n"
        }
        fn apply(&self, value: &i64) -> i64 {
            value + self.0
        }
    }

    #[derive(Debug)]
    struct Double;

    impl Mutation<i64> for Double {
        fn name(&self) -> &'static str {
            "double"
        }
        fn apply(&self, value: &i64) -> i64 {
            value * 2
        }
    }

    fn int_seed(value: i64) -> Arc<Seed<i64>> {
        Arc::new(Seed::new("int", value))
    }

    fn log_input(labels: &[&str]) -> Input<MessageLog, LogMutation> {
        Input::new(Arc::new(Seed::new("seed.json", labelled_log(labels))))
    }

    #[test]
    fn mutate_leaves_original_input_untouched() {
        let base = log_input(&["A", "B", "C"]);
        let mutated = base.mutate(LogMutation::DropMessage { index: 1 });

        assert_eq!(payload_labels(&base.value()), vec!["A", "B", "C"]);
        assert_eq!(base.chain_len(), 0);
        assert!(base.mutations().is_empty());

        assert_eq!(payload_labels(&mutated.value()), vec!["A", "C"]);
        assert_eq!(mutated.chain_len(), 1);
    }

    #[test]
    fn mutated_value_equals_mutation_applied_to_base_value() {
        let base = log_input(&["A", "B", "C"]).mutate(LogMutation::DuplicateMessage { index: 0 });
        let mutation = LogMutation::ReorderMessages { first: 0, second: 3 };
        assert_eq!(base.mutate(mutation).value(), mutation.apply(&base.value()));
    }

    #[test]
    fn repeated_value_reads_are_equal() {
        let input = log_input(&["A", "B", "C"])
            .mutate(LogMutation::DropMessage { index: 0 })
            .mutate(LogMutation::CorruptPayload {
                index: 0,
                offset: 0,
                mask: 1,
            });
        assert_eq!(input.value(), input.value());
    }

    #[test]
    fn sibling_inputs_do_not_see_each_others_chains() {
        let base = Input::<i64, Box<dyn Mutation<i64>>>::new(int_seed(3))
            .mutate(Box::new(AddN(1)));
        let left = base.mutate(Box::new(Double));
        let right = base.mutate(Box::new(AddN(10)));

        assert_eq!(base.value(), 4);
        assert_eq!(left.value(), 8);
        assert_eq!(right.value(), 14);

        let left_names: Vec<&str> = left.mutations().iter().map(|m| m.name()).collect();
        let right_names: Vec<&str> = right.mutations().iter().map(|m| m.name()).collect();
        assert_eq!(left_names, vec!["add-n", "double"]);
        assert_eq!(right_names, vec!["add-n", "add-n"]);
        assert_eq!(base.chain_len(), 1);
    }

    #[test]
    fn chain_is_folded_in_order() {
        let input = Input::<i64, Box<dyn Mutation<i64>>>::new(int_seed(1))
            .mutate(Box::new(AddN(2)))
            .mutate(Box::new(Double));
        assert_eq!(input.value(), 6);
    }

    #[test]
    fn deep_chains_drop_without_overflowing() {
        let mut input = Input::<i64, Box<dyn Mutation<i64>>>::new(int_seed(0));
        for _ in 0..200_000 {
            input = input.mutate(Box::new(AddN(1)));
        }
        assert_eq!(input.chain_len(), 200_000);
        drop(input);
    }
}
