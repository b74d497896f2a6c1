//! Pull-driven stream combinators.
//!
//! The analysis pipeline is assembled from values implementing [`Source`]:
//! a pull interface where the sink drives and back-pressure is implicit.
//! All stages are strictly single-pass; the only stages that touch disk
//! are the external [`sort::sort_by`] and [`sort::materialize`], which
//! spill through encrypted temporary files with a bounded in-memory run.
//!
//! Combinators compose by value into nested generic types, the same way
//! `Iterator` adapters do; `next` returns `Result` so file and
//! authentication errors propagate out of the pipeline with `?`.

pub mod adapters;
pub mod join;
pub mod records;
pub mod sort;

pub use adapters::{Filter, FlatMap, GroupBy, Inspect, Map, Squash, TryMap};
pub use join::{outer_join, OuterJoin};
pub use records::{RecordSink, RecordSource, VecSource};
pub use sort::{materialize, sort_by, Materialized, SortedSource};

use footfall_error::Result;

/// A pull-driven stream of records.
pub trait Source {
    type Item;

    /// Produce the next record, `None` once exhausted.
    fn next(&mut self) -> Result<Option<Self::Item>>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    type Item = S::Item;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        (**self).next()
    }
}

/// Combinator constructors, blanket-implemented for every source.
pub trait SourceExt: Source + Sized {
    fn map<O, F>(self, f: F) -> Map<Self, F>
    where
        F: FnMut(Self::Item) -> O,
    {
        Map::new(self, f)
    }

    /// Like [`SourceExt::map`], for fallible transforms (for example
    /// pseudonym decryption).
    fn try_map<O, F>(self, f: F) -> TryMap<Self, F>
    where
        F: FnMut(Self::Item) -> Result<O>,
    {
        TryMap::new(self, f)
    }

    fn filter<F>(self, keep: F) -> Filter<Self, F>
    where
        F: FnMut(&Self::Item) -> bool,
    {
        Filter::new(self, keep)
    }

    /// Side-effecting pass-through.
    fn inspect<F>(self, f: F) -> Inspect<Self, F>
    where
        F: FnMut(&Self::Item),
    {
        Inspect::new(self, f)
    }

    /// Gather maximal runs of `eq`-consecutive records into vectors.
    fn group_by<E>(self, eq: E) -> GroupBy<Self, E>
    where
        E: FnMut(&Self::Item, &Self::Item) -> bool,
    {
        GroupBy::new(self, eq)
    }

    /// Per-group expansion: `f` receives one group and appends any number
    /// of outputs. Only available downstream of [`SourceExt::group_by`].
    fn flat_map<I, O, F>(self, f: F) -> FlatMap<Self, F, O>
    where
        Self: Source<Item = Vec<I>>,
        F: FnMut(Vec<I>, &mut Vec<O>),
    {
        FlatMap::new(self, f)
    }

    /// O(1)-memory `group_by` + `flat_map` for groups that fold into
    /// exactly one output.
    fn squash<A, E, I, F>(self, eq: E, init: I, fold: F) -> Squash<Self, E, I, F, A>
    where
        E: FnMut(&Self::Item, &Self::Item) -> bool,
        I: FnMut(&Self::Item) -> A,
        F: FnMut(&mut A, &Self::Item),
    {
        Squash::new(self, eq, init, fold)
    }

    /// Drain the stream into a side-effecting sink.
    fn for_each<F>(mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Self::Item) -> Result<()>,
    {
        while let Some(item) = self.next()? {
            f(item)?;
        }
        Ok(())
    }

    /// Drain the stream into a vector (reports, tests).
    fn collect_vec(mut self) -> Result<Vec<Self::Item>> {
        let mut out = Vec::new();
        while let Some(item) = self.next()? {
            out.push(item);
        }
        Ok(out)
    }
}

impl<S: Source> SourceExt for S {}
