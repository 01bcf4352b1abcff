use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    error::FetchError,
    models::PhysicianRecord,
    postal::{PostalCode, fsa_of},
    rate_limiter::{AdaptiveRateLimiter, RetryPolicy, run_with_retry},
    registry::{RegistryPage, RegistryTransport, SearchFilters},
};

/// One pending query of an expansion pass. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFrontierNode {
    pub code: PostalCode,
    pub depth: u32,
}

/// Pending codes plus the seen-set that guarantees each code is queried once.
#[derive(Debug, Default)]
pub struct Frontier {
    seen: HashSet<PostalCode>,
    pending: VecDeque<SearchFrontierNode>,
}

impl Frontier {
    /// Queues `code` unless it was already queued or queried.
    pub fn push(&mut self, code: PostalCode, depth: u32) -> bool {
        if !self.seen.insert(code.clone()) {
            return false;
        }
        self.pending.push_back(SearchFrontierNode { code, depth });
        true
    }

    pub fn pop(&mut self) -> Option<SearchFrontierNode> {
        self.pending.pop_front()
    }

    pub fn take_pass(&mut self) -> Vec<SearchFrontierNode> {
        self.pending.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Merges leaf results, deduplicating by registration number.
///
/// Records without a registration number cannot be deduplicated safely and
/// are always kept.
#[derive(Debug, Default)]
pub struct RecordMerger {
    seen_registrations: HashSet<String>,
    records: Vec<PhysicianRecord>,
    duplicates_skipped: usize,
}

impl RecordMerger {
    pub fn absorb(&mut self, records: Vec<PhysicianRecord>) -> usize {
        let mut added = 0usize;
        for record in records {
            match record.registration_number.as_deref().map(str::trim) {
                Some(reg) if !reg.is_empty() => {
                    if self.seen_registrations.insert(reg.to_string()) {
                        self.records.push(record);
                        added += 1;
                    } else {
                        self.duplicates_skipped += 1;
                    }
                }
                _ => {
                    self.records.push(record);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedQuery {
    pub code: String,
    pub attempts: u32,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchReport {
    pub records: Vec<PhysicianRecord>,
    /// Leaf codes that answered with a (possibly empty) result list.
    pub leaves_resolved: usize,
    /// HTTP requests issued, retries included.
    pub requests_issued: usize,
    pub codes_visited: usize,
    pub duplicates_skipped: usize,
    /// Codes still overflowing at full specificity.
    pub partial_coverage: Vec<String>,
    pub failures: Vec<FailedQuery>,
    pub passes: usize,
}

impl SearchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.partial_coverage.is_empty()
    }

    /// FSAs containing a failed or still-overflowing query.
    pub fn incomplete_areas(&self) -> HashSet<String> {
        self.failures
            .iter()
            .map(|failure| failure.code.as_str())
            .chain(self.partial_coverage.iter().map(String::as_str))
            .filter_map(fsa_of)
            .collect()
    }
}

/// Result of a single query once the page has been interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Overflow,
    Records(Vec<PhysicianRecord>),
}

/// Book-keeping shared by sequential and parallel expansion.
#[derive(Debug, Default)]
pub struct ExpansionState {
    frontier: Frontier,
    merger: RecordMerger,
    leaves_resolved: usize,
    requests_issued: usize,
    max_depth: Option<u32>,
    partial_coverage: Vec<String>,
    failures: Vec<FailedQuery>,
}

impl ExpansionState {
    pub fn new(seeds: impl IntoIterator<Item = PostalCode>) -> Self {
        let mut state = Self::default();
        for seed in seeds {
            state.frontier.push(seed, 0);
        }
        state
    }

    pub fn next(&mut self) -> Option<SearchFrontierNode> {
        self.frontier.pop()
    }

    pub fn take_pass(&mut self) -> Vec<SearchFrontierNode> {
        self.frontier.take_pass()
    }

    pub fn has_pending(&self) -> bool {
        !self.frontier.is_empty()
    }

    pub fn apply(
        &mut self,
        node: SearchFrontierNode,
        result: Result<QueryOutcome, FetchError>,
        attempts: u32,
    ) {
        self.requests_issued += attempts as usize;
        self.max_depth = Some(self.max_depth.map_or(node.depth, |d| d.max(node.depth)));

        match result {
            Ok(QueryOutcome::Overflow) => {
                let children = node.code.children();
                if children.is_empty() {
                    tracing::warn!(
                        "{} still overflows at full specificity; coverage is partial",
                        node.code
                    );
                    self.partial_coverage.push(node.code.to_string());
                    return;
                }
                tracing::debug!("{} overflows; expanding to {} codes", node.code, children.len());
                for child in children {
                    self.frontier.push(child, node.depth + 1);
                }
            }
            Ok(QueryOutcome::Records(records)) => {
                self.leaves_resolved += 1;
                let found = records.len();
                let added = self.merger.absorb(records);
                tracing::debug!("{}: {} records ({} new)", node.code, found, added);
            }
            Err(err) => {
                tracing::warn!(
                    "registry query for {} failed after {} attempt(s): {}",
                    node.code,
                    attempts,
                    err
                );
                self.failures.push(FailedQuery {
                    code: node.code.to_string(),
                    attempts,
                    kind: err.kind().to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Records a query that was never dispatched because shutdown was requested.
    pub fn cancel(&mut self, node: SearchFrontierNode) {
        self.failures.push(FailedQuery {
            code: node.code.to_string(),
            attempts: 0,
            kind: "cancelled".to_string(),
            reason: "shutdown requested before dispatch".to_string(),
        });
    }

    pub fn finish(self) -> SearchReport {
        SearchReport {
            records: self.merger.records,
            leaves_resolved: self.leaves_resolved,
            requests_issued: self.requests_issued,
            codes_visited: self.frontier.seen_count(),
            duplicates_skipped: self.merger.duplicates_skipped,
            partial_coverage: self.partial_coverage,
            failures: self.failures,
            passes: self.max_depth.map_or(0, |d| d as usize + 1),
        }
    }
}

/// Issues paced registry queries and subdivides codes that overflow.
pub struct RegistryQueryExpander {
    transport: Arc<dyn RegistryTransport>,
    limiter: Arc<AdaptiveRateLimiter>,
    filters: SearchFilters,
    max_enumerable: usize,
}

impl RegistryQueryExpander {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        limiter: Arc<AdaptiveRateLimiter>,
        filters: SearchFilters,
        max_enumerable: usize,
    ) -> Self {
        Self {
            transport,
            limiter,
            filters,
            max_enumerable,
        }
    }

    pub fn filters(&self) -> &SearchFilters {
        &self.filters
    }

    pub fn with_filters(&self, filters: SearchFilters) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            limiter: Arc::clone(&self.limiter),
            filters,
            max_enumerable: self.max_enumerable,
        }
    }

    /// One paced request for `code`; the outcome is fed back to the limiter.
    pub async fn query(&self, code: &PostalCode) -> Result<QueryOutcome, FetchError> {
        self.limiter.acquire().await;
        let result = self.transport.search(code, &self.filters).await;
        self.limiter.record_result(&result);

        match result? {
            RegistryPage::Overflow => Ok(QueryOutcome::Overflow),
            RegistryPage::Entries(entries) => {
                if entries.len() > self.max_enumerable {
                    tracing::warn!(
                        "{} returned {} entries, above the expected limit of {}",
                        code,
                        entries.len(),
                        self.max_enumerable
                    );
                }
                let records = entries
                    .into_iter()
                    .filter_map(|entry| entry.into_record(code))
                    .collect();
                Ok(QueryOutcome::Records(records))
            }
        }
    }

    /// Query with per-request retries; returns the outcome and attempts made.
    pub async fn query_with_retry(
        &self,
        code: &PostalCode,
        retry: &RetryPolicy,
    ) -> (Result<QueryOutcome, FetchError>, u32) {
        let label = format!("registry {code}");
        run_with_retry(retry, &label, || self.query(code)).await
    }

    /// Single-threaded breadth-first expansion from one seed.
    pub async fn expand_seed(&self, seed: PostalCode, retry: &RetryPolicy) -> SearchReport {
        let mut state = ExpansionState::new([seed]);
        while let Some(node) = state.next() {
            let (result, attempts) = self.query_with_retry(&node.code, retry).await;
            state.apply(node, result, attempts);
        }
        let report = state.finish();
        tracing::info!(
            "expansion done: {} records from {} leaves ({} codes visited, {} failed)",
            report.records.len(),
            report.leaves_resolved,
            report.codes_visited,
            report.failures.len()
        );
        report
    }
}
