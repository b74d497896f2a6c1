//! Single-pass stream adapters.

use footfall_error::Result;

use crate::Source;

pub struct Map<S, F> {
    inner: S,
    f: F,
}

impl<S, F> Map<S, F> {
    pub(crate) fn new(inner: S, f: F) -> Self {
        Self { inner, f }
    }
}

impl<S, O, F> Source for Map<S, F>
where
    S: Source,
    F: FnMut(S::Item) -> O,
{
    type Item = O;

    fn next(&mut self) -> Result<Option<O>> {
        Ok(self.inner.next()?.map(&mut self.f))
    }
}

pub struct TryMap<S, F> {
    inner: S,
    f: F,
}

impl<S, F> TryMap<S, F> {
    pub(crate) fn new(inner: S, f: F) -> Self {
        Self { inner, f }
    }
}

impl<S, O, F> Source for TryMap<S, F>
where
    S: Source,
    F: FnMut(S::Item) -> Result<O>,
{
    type Item = O;

    fn next(&mut self) -> Result<Option<O>> {
        match self.inner.next()? {
            Some(item) => Ok(Some((self.f)(item)?)),
            None => Ok(None),
        }
    }
}

pub struct Filter<S, F> {
    inner: S,
    keep: F,
}

impl<S, F> Filter<S, F> {
    pub(crate) fn new(inner: S, keep: F) -> Self {
        Self { inner, keep }
    }
}

impl<S, F> Source for Filter<S, F>
where
    S: Source,
    F: FnMut(&S::Item) -> bool,
{
    type Item = S::Item;

    fn next(&mut self) -> Result<Option<S::Item>> {
        while let Some(item) = self.inner.next()? {
            if (self.keep)(&item) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

pub struct Inspect<S, F> {
    inner: S,
    f: F,
}

impl<S, F> Inspect<S, F> {
    pub(crate) fn new(inner: S, f: F) -> Self {
        Self { inner, f }
    }
}

impl<S, F> Source for Inspect<S, F>
where
    S: Source,
    F: FnMut(&S::Item),
{
    type Item = S::Item;

    fn next(&mut self) -> Result<Option<S::Item>> {
        let item = self.inner.next()?;
        if let Some(item) = &item {
            (self.f)(item);
        }
        Ok(item)
    }
}

/// Gathers maximal runs of equal-keyed records. Group size is bounded by
/// the records per key, never by the stream length.
pub struct GroupBy<S: Source, E> {
    inner: S,
    eq: E,
    /// First record of the next group, read past the current boundary.
    pending: Option<S::Item>,
    exhausted: bool,
}

impl<S: Source, E> GroupBy<S, E> {
    pub(crate) fn new(inner: S, eq: E) -> Self {
        Self {
            inner,
            eq,
            pending: None,
            exhausted: false,
        }
    }
}

impl<S, E> Source for GroupBy<S, E>
where
    S: Source,
    E: FnMut(&S::Item, &S::Item) -> bool,
{
    type Item = Vec<S::Item>;

    fn next(&mut self) -> Result<Option<Vec<S::Item>>> {
        if self.exhausted {
            return Ok(None);
        }
        let first = match self.pending.take() {
            Some(item) => item,
            None => match self.inner.next()? {
                Some(item) => item,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            },
        };

        let mut group = vec![first];
        loop {
            match self.inner.next()? {
                Some(item) if (self.eq)(&group[0], &item) => group.push(item),
                Some(item) => {
                    self.pending = Some(item);
                    break;
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(Some(group))
    }
}

/// Expands each group into zero or more outputs via a caller-supplied
/// append function.
pub struct FlatMap<S, F, O> {
    inner: S,
    f: F,
    buffer: std::vec::IntoIter<O>,
}

impl<S, F, O> FlatMap<S, F, O> {
    pub(crate) fn new(inner: S, f: F) -> Self {
        Self {
            inner,
            f,
            buffer: Vec::new().into_iter(),
        }
    }
}

impl<S, I, O, F> Source for FlatMap<S, F, O>
where
    S: Source<Item = Vec<I>>,
    F: FnMut(Vec<I>, &mut Vec<O>),
{
    type Item = O;

    fn next(&mut self) -> Result<Option<O>> {
        loop {
            if let Some(out) = self.buffer.next() {
                return Ok(Some(out));
            }
            match self.inner.next()? {
                Some(group) => {
                    let mut out = Vec::new();
                    (self.f)(group, &mut out);
                    self.buffer = out.into_iter();
                }
                None => return Ok(None),
            }
        }
    }
}

/// Folds each run of equal-keyed records into one accumulator with O(1)
/// memory. The accumulator is initialised from a group's first record and
/// then folded over every record of the group, the first included.
pub struct Squash<S: Source, E, I, F, A> {
    inner: S,
    eq: E,
    init: I,
    fold: F,
    /// Representative record and accumulator of the open group.
    current: Option<(S::Item, A)>,
    exhausted: bool,
}

impl<S: Source, E, I, F, A> Squash<S, E, I, F, A> {
    pub(crate) fn new(inner: S, eq: E, init: I, fold: F) -> Self {
        Self {
            inner,
            eq,
            init,
            fold,
            current: None,
            exhausted: false,
        }
    }

    fn open_group(&mut self, item: S::Item)
    where
        I: FnMut(&S::Item) -> A,
        F: FnMut(&mut A, &S::Item),
    {
        let mut acc = (self.init)(&item);
        (self.fold)(&mut acc, &item);
        self.current = Some((item, acc));
    }
}

impl<S, E, I, F, A> Source for Squash<S, E, I, F, A>
where
    S: Source,
    E: FnMut(&S::Item, &S::Item) -> bool,
    I: FnMut(&S::Item) -> A,
    F: FnMut(&mut A, &S::Item),
{
    type Item = A;

    fn next(&mut self) -> Result<Option<A>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            match self.inner.next()? {
                Some(item) => match &mut self.current {
                    Some((representative, acc)) if (self.eq)(representative, &item) => {
                        (self.fold)(acc, &item);
                    }
                    Some(_) => {
                        let (_, finished) = self.current.take().expect("group is open");
                        self.open_group(item);
                        return Ok(Some(finished));
                    }
                    None => self.open_group(item),
                },
                None => {
                    self.exhausted = true;
                    return Ok(self.current.take().map(|(_, acc)| acc));
                }
            }
        }
    }
}
