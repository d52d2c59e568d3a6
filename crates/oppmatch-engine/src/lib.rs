//! In-memory matching engine for the Opportunity Match Server.
//!
//! Holds the indexed store of organizations, opportunities, users and
//! keywords, scores free-text user interests against the keyword vocabulary
//! with a Levenshtein-derived similarity, and materializes the
//! (keyword x opportunity x user) match relation for filtered retrieval.
//! Nothing here is persisted; restarting the process clears all state.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use oppmatch_core::{
    IngestError, IngestOutcome, Keyword, KeywordOpportunity, MatchRecord, MatchRow, Opportunity,
    OpportunityId, OpportunityInput, OrgName, Organization, RejectedRecord, User, UserId,
    UserInput,
};
use serde::Serialize;
use strsim::normalized_levenshtein;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppmatch-engine";

/// Default minimum similarity score for an interest to count as a match.
pub const DEFAULT_SCORE_CUTOFF: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interests scoring below this (0-100) produce no MatchRecord.
    pub score_cutoff: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            score_cutoff: DEFAULT_SCORE_CUTOFF,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            score_cutoff: std::env::var("OPPMATCH_SCORE_CUTOFF")
                .ok()
                .and_then(|v| v.parse::<u8>().ok())
                .map(|v| v.min(100))
                .unwrap_or(DEFAULT_SCORE_CUTOFF),
        }
    }
}

/// Case-insensitive Levenshtein similarity scaled to 0-100.
pub fn similarity(a: &str, b: &str) -> u8 {
    (normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase()) * 100.0).round() as u8
}

/// Best qualifying (interest, score) pair for one keyword. Maximum score
/// wins; ties go to the lexicographically earliest interest.
fn best_match<'a>(keyword: &str, interests: &'a [String], cutoff: u8) -> Option<(&'a str, u8)> {
    let keyword_lower = keyword.to_lowercase();
    let keyword_len = keyword_lower.chars().count();
    let mut best: Option<(&'a str, u8)> = None;

    for interest in interests {
        let interest_lower = interest.to_lowercase();
        let interest_len = interest_lower.chars().count();

        // The length difference alone caps the achievable score; skip the
        // full distance computation when that cap is below the cutoff.
        let longest = keyword_len.max(interest_len);
        if longest > 0 {
            let cap = (1.0 - keyword_len.abs_diff(interest_len) as f64 / longest as f64) * 100.0;
            if (cap.round() as u8) < cutoff {
                continue;
            }
        }

        let score = (normalized_levenshtein(&keyword_lower, &interest_lower) * 100.0).round() as u8;
        if score < cutoff {
            continue;
        }

        let replace = match best {
            None => true,
            Some((best_interest, best_score)) => {
                score > best_score || (score == best_score && interest.as_str() < best_interest)
            }
        };
        if replace {
            best = Some((interest.as_str(), score));
        }
    }

    best
}

/// Canonical set of matchable role strings. Keywords are created lazily the
/// first time a role is seen and never removed; iteration follows
/// registration order.
#[derive(Debug, Default)]
pub struct KeywordRegistry {
    order: Vec<String>,
    entries: HashMap<String, Keyword>,
}

impl KeywordRegistry {
    /// Registers the role if absent. Returns whether it was newly created.
    pub fn ensure(&mut self, role: &str) -> bool {
        if self.entries.contains_key(role) {
            return false;
        }
        self.order.push(role.to_string());
        self.entries.insert(role.to_string(), Keyword::new(role));
        true
    }

    pub fn get(&self, role: &str) -> Option<&Keyword> {
        self.entries.get(role)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keywords in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Keyword> {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    fn entry_mut(&mut self, role: &str) -> Option<&mut Keyword> {
        self.entries.get_mut(role)
    }

    fn link_opportunity(&mut self, role: &str, opportunity_id: OpportunityId, org_name: OrgName) {
        if let Some(keyword) = self.entries.get_mut(role) {
            keyword.opportunities.push(KeywordOpportunity {
                opportunity_id,
                org_name,
            });
        }
    }

    /// Recomputes the user's MatchRecord for every registered keyword.
    /// Keywords with no qualifying interest drop any stale record from a
    /// prior ingestion of the same user id.
    fn record_user_matches(&mut self, user: &User, cutoff: u8) {
        let display_name = user.display_name();
        for keyword in self.entries.values_mut() {
            match best_match(&keyword.name, &user.interested_in, cutoff) {
                Some((interest, score)) => {
                    keyword.users.insert(
                        user.id.clone(),
                        MatchRecord {
                            user_name: display_name.clone(),
                            interest: interest.to_string(),
                            score,
                        },
                    );
                }
                None => {
                    keyword.users.remove(&user.id);
                }
            }
        }
    }
}

/// Entity storage for organizations, opportunities and users. All read
/// accessors hand out owned snapshots.
#[derive(Debug, Default)]
pub struct EntityStore {
    organizations: BTreeMap<OrgName, Organization>,
    opportunities: BTreeMap<OpportunityId, Opportunity>,
    users: BTreeMap<UserId, User>,
}

impl EntityStore {
    /// Idempotent creation; no-op if the organization already exists.
    pub fn upsert_organization(&mut self, name: &OrgName) {
        self.organizations
            .entry(name.clone())
            .or_insert_with(|| Organization {
                id: Uuid::new_v4(),
                name: name.clone(),
                opportunity_ids: Vec::new(),
            });
    }

    /// Stores a new opportunity under a fresh id and links it into its
    /// organization, creating the organization first if needed.
    pub fn add_opportunity(
        &mut self,
        role: &str,
        email: Option<String>,
        org_name: &OrgName,
    ) -> OpportunityId {
        self.upsert_organization(org_name);
        let id = OpportunityId::generate();
        self.opportunities.insert(
            id,
            Opportunity {
                id,
                role: role.to_string(),
                email,
                organization: org_name.clone(),
                created_at: Utc::now(),
            },
        );
        if let Some(org) = self.organizations.get_mut(org_name) {
            org.opportunity_ids.push(id);
        }
        id
    }

    /// Stores or overwrites the user record keyed by its supplied id.
    pub fn add_user(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.opportunities.values().cloned().collect()
    }

    pub fn users(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    pub fn organizations(&self) -> Vec<Organization> {
        self.organizations.values().cloned().collect()
    }

    fn users_iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }
}

/// The matching engine: entity store plus keyword registry behind one owned
/// object. Hosts serving concurrent requests must guard it themselves, e.g.
/// with a readers-writer lock around the whole index.
#[derive(Debug, Default)]
pub struct MatchEngine {
    config: EngineConfig,
    store: EntityStore,
    registry: KeywordRegistry,
}

impl MatchEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: EntityStore::default(),
            registry: KeywordRegistry::default(),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Batch-ingests opportunities. Each input record fans out into one
    /// stored opportunity per role; malformed records are rejected
    /// individually and the rest of the batch proceeds.
    pub fn add_opportunities(&mut self, inputs: &[OpportunityInput]) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let mut fresh_keywords = Vec::new();

        for (index, input) in inputs.iter().enumerate() {
            let org = input.organization.trim();
            if org.is_empty() {
                outcome
                    .rejected
                    .push(RejectedRecord::new(index, &IngestError::BlankOrganization));
                continue;
            }
            if input.roles.iter().any(|role| role.trim().is_empty()) {
                outcome
                    .rejected
                    .push(RejectedRecord::new(index, &IngestError::BlankRole));
                continue;
            }

            let org_name = OrgName(org.to_string());
            self.store.upsert_organization(&org_name);
            for role in &input.roles {
                if self.registry.ensure(role) {
                    fresh_keywords.push(role.clone());
                }
                let opportunity_id =
                    self.store
                        .add_opportunity(role, input.email.clone(), &org_name);
                self.registry
                    .link_opportunity(role, opportunity_id, org_name.clone());
            }
            outcome.created += 1;
        }

        if !fresh_keywords.is_empty() {
            self.score_users_against_new_keywords(&fresh_keywords);
        }

        debug!(
            created = outcome.created,
            rejected = outcome.rejected.len(),
            keywords = self.registry.len(),
            "opportunity batch ingested"
        );
        outcome
    }

    /// Batch-ingests users and recomputes their match records against every
    /// registered keyword. Re-ingesting an id replaces the prior user record
    /// and all of its match records engine-wide.
    pub fn add_users(&mut self, inputs: &[UserInput]) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        for (index, input) in inputs.iter().enumerate() {
            let Some(id) = input.id.clone() else {
                outcome
                    .rejected
                    .push(RejectedRecord::new(index, &IngestError::MissingUserId));
                continue;
            };
            let user = User {
                id,
                first_name: input.first_name.clone(),
                last_name: input.last_name.clone(),
                email: input.email.clone(),
                interested_in: input.interested_in.clone(),
                ingested_at: Utc::now(),
            };
            self.registry
                .record_user_matches(&user, self.config.score_cutoff);
            self.store.add_user(user);
            outcome.created += 1;
        }

        debug!(
            created = outcome.created,
            rejected = outcome.rejected.len(),
            "user batch ingested"
        );
        outcome
    }

    /// Scores all stored users against keywords that did not exist before
    /// this ingestion batch. Existing (keyword, user) records are untouched.
    fn score_users_against_new_keywords(&mut self, names: &[String]) {
        let cutoff = self.config.score_cutoff;
        for user in self.store.users_iter() {
            for name in names {
                let Some(keyword) = self.registry.entry_mut(name) else {
                    continue;
                };
                if let Some((interest, score)) = best_match(name, &user.interested_in, cutoff) {
                    keyword.users.insert(
                        user.id.clone(),
                        MatchRecord {
                            user_name: user.display_name(),
                            interest: interest.to_string(),
                            score,
                        },
                    );
                }
            }
        }
    }

    /// Materializes the match relation: one row per (keyword, opportunity,
    /// user) triple where the keyword has both sides, optionally filtered by
    /// organization name and/or user id (exact string comparisons, ANDed).
    ///
    /// This is a cross-product per keyword, O(sum over keywords of
    /// |opportunities| * |users|). Acceptable while per-keyword fan-out
    /// stays small relative to the catalog; revisit if that breaks.
    /// Ordering is deterministic for unchanged state: keywords in
    /// registration order, opportunities in registration order, users in id
    /// order.
    pub fn list_matches(
        &self,
        filter_by_org_name: Option<&str>,
        filter_by_user_id: Option<&str>,
    ) -> Vec<MatchRow> {
        let mut rows = Vec::new();
        for keyword in self.registry.iter() {
            for link in &keyword.opportunities {
                if filter_by_org_name.is_some_and(|f| f != link.org_name.0) {
                    continue;
                }
                for (user_id, record) in &keyword.users {
                    if filter_by_user_id.is_some_and(|f| f != user_id.0) {
                        continue;
                    }
                    rows.push(MatchRow {
                        keyword: keyword.name.clone(),
                        opp_id: link.opportunity_id,
                        user_id: user_id.clone(),
                        org_name: link.org_name.clone(),
                        user_name: record.user_name.clone(),
                        interest: record.interest.clone(),
                        match_level: record.score,
                    });
                }
            }
        }
        rows
    }

    pub fn list_opportunities(&self) -> Vec<Opportunity> {
        self.store.opportunities()
    }

    pub fn list_users(&self) -> Vec<User> {
        self.store.users()
    }

    pub fn list_organizations(&self) -> Vec<Organization> {
        self.store.organizations()
    }

    /// Keywords in registration order, each with its opportunity links and
    /// per-user match records.
    pub fn list_keywords(&self) -> Vec<Keyword> {
        self.registry.iter().cloned().collect()
    }
}

/// One page of an ordered result sequence. Link URL construction is the
/// host's job; the pager only reports the neighboring page numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page_size: usize,
    pub previous_page: Option<usize>,
    pub next_page: Option<usize>,
}

/// Slices `items` into 1-indexed pages. Out-of-range page numbers yield an
/// empty data slice, not an error; `page_num` 0 is treated as 1.
pub fn paginate<T: Clone>(items: &[T], page_num: usize, page_size: usize) -> Page<T> {
    let page_num = page_num.max(1);
    let total = items.len();
    let start = (page_num - 1).saturating_mul(page_size);
    let raw_end = start.saturating_add(page_size);
    let data = if start >= total {
        Vec::new()
    } else {
        items[start..raw_end.min(total)].to_vec()
    };

    Page {
        data,
        total,
        page_size,
        previous_page: (page_num > 1).then(|| page_num - 1),
        next_page: (raw_end < total).then(|| page_num + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opp(org: &str, roles: &[&str]) -> OpportunityInput {
        OpportunityInput {
            organization: org.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            email: Some("jobs@example.org".to_string()),
        }
    }

    fn user(id: &str, first: &str, interests: &[&str]) -> UserInput {
        UserInput {
            id: Some(UserId(id.to_string())),
            first_name: Some(first.to_string()),
            last_name: Some("Doe".to_string()),
            email: None,
            interested_in: interests.iter().map(|i| i.to_string()).collect(),
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut registry = KeywordRegistry::default();
        assert!(registry.ensure("Engineer"));
        assert!(!registry.ensure("Engineer"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn similarity_is_case_insensitive_and_normalized() {
        assert_eq!(similarity("Engineer", "engineer"), 100);
        assert_eq!(similarity("Engineer", "Engineers"), 89);
        assert_eq!(similarity("Engineer", "Engineering"), 73);
        assert_eq!(similarity("Nurse", "Engineer"), similarity("Engineer", "Nurse"));
    }

    #[test]
    fn cutoff_rejects_score_just_below() {
        // "Engineers" scores 89 against "Engineer"; the default cutoff is 90.
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Engineer"])]);
        engine.add_users(&[user("U1", "Jane", &["Engineers"])]);
        assert!(engine.list_matches(None, None).is_empty());
        assert!(engine.list_keywords()[0].users.is_empty());
    }

    #[test]
    fn best_match_wins_over_later_lower_score() {
        // Both interests clear an 80 cutoff; a last-write-wins matcher would
        // keep the later, lower-scoring "Engineers".
        let mut engine = MatchEngine::new(EngineConfig { score_cutoff: 80 });
        engine.add_opportunities(&[opp("OrgA", &["Engineer"])]);
        engine.add_users(&[user("U1", "Jane", &["Engineer", "Engineers"])]);

        let keyword = &engine.list_keywords()[0];
        let record = keyword.users.get(&UserId("U1".into())).unwrap();
        assert_eq!(record.score, 100);
        assert_eq!(record.interest, "Engineer");
    }

    #[test]
    fn best_match_with_default_cutoff_keeps_maximum() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Engineer"])]);
        engine.add_users(&[user("U1", "Jane", &["Engineering", "Engineer"])]);

        let record = engine.list_keywords()[0]
            .users
            .get(&UserId("U1".into()))
            .cloned()
            .unwrap();
        assert_eq!(record.score, 100);
        assert_eq!(record.interest, "Engineer");
    }

    #[test]
    fn score_ties_prefer_lexicographically_earliest_interest() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Engineer"])]);
        // Both score 100 case-insensitively; "Engineer" orders before
        // "engineer".
        engine.add_users(&[user("U1", "Jane", &["engineer", "Engineer"])]);

        let record = engine.list_keywords()[0]
            .users
            .get(&UserId("U1".into()))
            .cloned()
            .unwrap();
        assert_eq!(record.interest, "Engineer");
    }

    #[test]
    fn match_relation_is_a_cross_product_per_keyword() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Nurse"]), opp("OrgB", &["Nurse"])]);
        engine.add_users(&[
            user("U1", "Jane", &["Nurse"]),
            user("U2", "John", &["Nurse"]),
        ]);

        let rows = engine.list_matches(None, None);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.keyword == "Nurse"));
        assert!(rows.iter().all(|r| r.match_level == 100));
        assert_eq!(
            rows.iter().filter(|r| r.org_name.0 == "OrgA").count(),
            2
        );
        assert_eq!(
            rows.iter().filter(|r| r.user_id.0 == "U2").count(),
            2
        );
    }

    #[test]
    fn filters_apply_exactly_and_combine() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Nurse"]), opp("OrgB", &["Nurse"])]);
        engine.add_users(&[
            user("U1", "Jane", &["Nurse"]),
            user("U2", "John", &["Nurse"]),
        ]);

        let by_org = engine.list_matches(Some("OrgA"), None);
        assert_eq!(by_org.len(), 2);
        assert!(by_org.iter().all(|r| r.org_name.0 == "OrgA"));

        let by_user = engine.list_matches(None, Some("U1"));
        assert_eq!(by_user.len(), 2);
        assert!(by_user.iter().all(|r| r.user_id.0 == "U1"));

        let both = engine.list_matches(Some("OrgB"), Some("U2"));
        assert_eq!(both.len(), 1);

        assert!(engine.list_matches(Some("NoSuchOrg"), None).is_empty());
    }

    #[test]
    fn reingesting_a_user_replaces_prior_match_records() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Nurse"]), opp("OrgB", &["Plumber"])]);
        engine.add_users(&[user("U1", "Jane", &["Nurse"])]);
        assert_eq!(engine.list_matches(None, None).len(), 1);

        engine.add_users(&[user("U1", "Jane", &["Plumber"])]);
        let rows = engine.list_matches(None, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].keyword, "Plumber");

        let users = engine.list_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].interested_in, vec!["Plumber".to_string()]);
    }

    #[test]
    fn new_keywords_score_already_stored_users() {
        let mut engine = MatchEngine::default();
        engine.add_users(&[user("U1", "Jane", &["Nurse"])]);
        assert!(engine.list_matches(None, None).is_empty());

        engine.add_opportunities(&[opp("OrgA", &["Nurse"])]);
        let rows = engine.list_matches(None, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id.0, "U1");
    }

    #[test]
    fn missing_user_id_rejects_only_that_record() {
        let mut engine = MatchEngine::default();
        let inputs = vec![
            UserInput {
                id: None,
                first_name: Some("Ghost".into()),
                last_name: None,
                email: None,
                interested_in: vec!["Nurse".into()],
            },
            user("U2", "John", &["Nurse"]),
        ];
        let outcome = engine.add_users(&inputs);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].index, 0);
        assert_eq!(engine.list_users().len(), 1);
    }

    #[test]
    fn blank_role_rejects_record_before_mutation() {
        let mut engine = MatchEngine::default();
        let outcome = engine.add_opportunities(&[
            opp("OrgA", &["", "Nurse"]),
            opp("OrgB", &["Plumber"]),
        ]);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].index, 0);
        // The rejected record created neither its organization nor keywords.
        assert_eq!(engine.list_organizations().len(), 1);
        assert_eq!(engine.list_keywords().len(), 1);
        assert_eq!(engine.list_keywords()[0].name, "Plumber");
    }

    #[test]
    fn blank_organization_rejects_record() {
        let mut engine = MatchEngine::default();
        let outcome = engine.add_opportunities(&[opp("   ", &["Nurse"])]);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(engine.list_organizations().is_empty());
    }

    #[test]
    fn organizations_accumulate_opportunity_links() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Nurse", "Plumber"]), opp("OrgA", &["Chef"])]);
        let orgs = engine.list_organizations();
        assert_eq!(orgs.len(), 1);
        assert_eq!(orgs[0].opportunity_ids.len(), 3);
        assert_eq!(engine.list_opportunities().len(), 3);
    }

    #[test]
    fn keywords_iterate_in_registration_order() {
        let mut engine = MatchEngine::default();
        engine.add_opportunities(&[opp("OrgA", &["Zeta"]), opp("OrgA", &["Alpha"])]);
        let names: Vec<String> = engine.list_keywords().into_iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["Zeta".to_string(), "Alpha".to_string()]);
    }

    #[test]
    fn length_prune_never_drops_a_qualifying_interest() {
        // Near-boundary pair: lengths 8 vs 9 cap the score at 89 exactly,
        // so an 89 cutoff must still evaluate it.
        let interests = ["Engineers".to_string()];
        let matched = best_match(
            "Engineer",
            &interests,
            89,
        );
        assert_eq!(matched, Some(("Engineers", 89)));
        // Hopeless length difference is skipped entirely and finds nothing.
        assert_eq!(best_match("ab", &["abcdefgh".to_string()], 90), None);
    }

    #[test]
    fn paginate_middle_and_last_pages() {
        let items: Vec<usize> = (0..25).collect();

        let page = paginate(&items, 3, 10);
        assert_eq!(page.data, (20..25).collect::<Vec<_>>());
        assert_eq!(page.total, 25);
        assert_eq!(page.previous_page, Some(2));
        assert_eq!(page.next_page, None);

        let first = paginate(&items, 1, 10);
        assert_eq!(first.data.len(), 10);
        assert_eq!(first.previous_page, None);
        assert_eq!(first.next_page, Some(2));
    }

    #[test]
    fn paginate_out_of_range_is_empty_not_an_error() {
        let items: Vec<usize> = (0..25).collect();
        let page = paginate(&items, 99, 10);
        assert!(page.data.is_empty());
        assert_eq!(page.total, 25);
        assert_eq!(page.previous_page, Some(98));
        assert_eq!(page.next_page, None);
    }

    #[test]
    fn paginate_treats_page_zero_as_page_one() {
        let items: Vec<usize> = (0..5).collect();
        let page = paginate(&items, 0, 2);
        assert_eq!(page.data, vec![0, 1]);
        assert_eq!(page.previous_page, None);
        assert_eq!(page.next_page, Some(2));
    }

    #[test]
    fn default_cutoff_is_ninety() {
        assert_eq!(EngineConfig::default().score_cutoff, DEFAULT_SCORE_CUTOFF);
        assert_eq!(DEFAULT_SCORE_CUTOFF, 90);
    }
}
