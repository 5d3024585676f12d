//! Batched resolution of deferred references.
//!
//! Loading an entity records a [`PendingRef`] for every eager reference it
//! holds. The [`BatchLoader`] fetches those keys round by round, one
//! `get_batch` per round, decoding each fetched record and collecting the
//! references it holds in turn. Finalization then walks the fetched graph
//! depth first: every entity has its references attached before its
//! after-load hooks run, and a reference that closes a cycle stays
//! unresolved. The entities the caller decoded itself are roots: they are
//! never fetched again, and references back to them close a cycle too.

use std::collections::{HashMap, HashSet};

use entmap_store::Datastore;
use entmap_translate::{DecodedEntity, LoadContext, PendingRef, Registry, Resolved};
use entmap_types::RawKey;
use tracing::{debug, warn};

use crate::error::MapperResult;

/// Counters of one batch load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rounds: usize,
    pub fetched: usize,
    pub missing: usize,
    pub unresolved: usize,
}

struct Fetched {
    decoded: Option<Box<dyn DecodedEntity>>,
    deps: Vec<usize>,
}

enum Mark {
    Visiting,
    Done(Option<Resolved>),
}

/// Arena of every pending reference seen in one load, with the fetched
/// records decoded so far.
#[derive(Default)]
struct Graph {
    refs: Vec<PendingRef>,
    fetched: HashMap<RawKey, Fetched>,
    missing: HashSet<RawKey>,
    roots: HashSet<RawKey>,
    marks: HashMap<RawKey, Mark>,
}

impl Graph {
    fn push_all(&mut self, pending: Vec<PendingRef>) -> Vec<usize> {
        let start = self.refs.len();
        self.refs.extend(pending);
        (start..self.refs.len()).collect()
    }

    fn is_known(&self, key: &RawKey) -> bool {
        self.fetched.contains_key(key) || self.missing.contains(key) || self.roots.contains(key)
    }

    /// Finish the entity stored under `key` after attaching its own
    /// references. `None` for missing entities and cycle back edges.
    fn finish(&mut self, key: &RawKey, stats: &mut LoadStats) -> Option<Resolved> {
        match self.marks.get(key) {
            Some(Mark::Done(value)) => return value.clone(),
            Some(Mark::Visiting) => {
                debug!(key = %key, "reference cycle left unresolved");
                return None;
            }
            None if self.roots.contains(key) => {
                debug!(key = %key, "reference back to a load root left unresolved");
                return None;
            }
            None => {}
        }
        let entry = self.fetched.get_mut(key)?;
        let deps = std::mem::take(&mut entry.deps);
        let decoded = entry.decoded.take();

        self.marks.insert(key.clone(), Mark::Visiting);
        self.attach(&deps, stats);
        let value = decoded.map(|d| d.finish());
        self.marks.insert(key.clone(), Mark::Done(value.clone()));
        value
    }

    fn attach(&mut self, deps: &[usize], stats: &mut LoadStats) {
        for &index in deps {
            let key = self.refs[index].key().clone();
            match self.finish(&key, stats) {
                Some(value) => {
                    if !self.refs[index].attach(&value) {
                        warn!(key = %key, "resolved entity has an unexpected type");
                        stats.unresolved += 1;
                    }
                }
                None => stats.unresolved += 1,
            }
        }
    }
}

/// Runs phase 2 of a load against a datastore.
pub struct BatchLoader<'a, S: ?Sized> {
    store: &'a S,
    registry: &'a Registry,
    groups: &'a [String],
    max_rounds: usize,
    roots: Vec<RawKey>,
}

impl<'a, S: Datastore + ?Sized> BatchLoader<'a, S> {
    pub fn new(
        store: &'a S,
        registry: &'a Registry,
        groups: &'a [String],
        max_rounds: usize,
    ) -> Self {
        Self {
            store,
            registry,
            groups,
            max_rounds,
            roots: Vec::new(),
        }
    }

    /// Keys of the entities the caller already decoded.
    pub fn with_roots(mut self, roots: Vec<RawKey>) -> Self {
        self.roots = roots;
        self
    }

    /// Fetch, decode and attach everything reachable from `pending`.
    ///
    /// `pending` are the references recorded while decoding the roots; the
    /// roots' own after-load hooks are left to the caller and must run
    /// after this returns.
    pub fn resolve(&self, pending: Vec<PendingRef>) -> MapperResult<LoadStats> {
        let mut graph = Graph {
            roots: self.roots.iter().cloned().collect(),
            ..Graph::default()
        };
        let mut stats = LoadStats::default();
        let roots = graph.push_all(pending);
        let mut frontier = roots.clone();

        while !frontier.is_empty() {
            if stats.rounds == self.max_rounds {
                warn!(
                    rounds = stats.rounds,
                    remaining = frontier.len(),
                    "batch round limit reached; leaving references unresolved"
                );
                break;
            }

            let mut keys: Vec<RawKey> = Vec::new();
            let mut binding: HashMap<RawKey, usize> = HashMap::new();
            for index in frontier.drain(..) {
                let key = graph.refs[index].key();
                if graph.is_known(key) || binding.contains_key(key) {
                    continue;
                }
                binding.insert(key.clone(), index);
                keys.push(key.clone());
            }
            if keys.is_empty() {
                break;
            }

            stats.rounds += 1;
            let records = self.store.get_batch(&keys)?;
            debug!(round = stats.rounds, keys = keys.len(), "fetched reference batch");

            for (key, record) in keys.into_iter().zip(records) {
                let Some(record) = record else {
                    warn!(key = %key, "referenced entity not found");
                    stats.missing += 1;
                    graph.missing.insert(key);
                    continue;
                };
                let mut ctx = LoadContext::with_groups(self.registry, self.groups.to_vec());
                let decoded = graph.refs[binding[&key]].decode(&record, &mut ctx)?;
                let deps = graph.push_all(ctx.take_pending());
                frontier.extend(deps.iter().copied());
                stats.fetched += 1;
                graph.fetched.insert(
                    key,
                    Fetched {
                        decoded: Some(decoded),
                        deps,
                    },
                );
            }
        }

        graph.attach(&roots, &mut stats);
        debug!(
            rounds = stats.rounds,
            fetched = stats.fetched,
            unresolved = stats.unresolved,
            "batch load settled"
        );
        Ok(stats)
    }
}
