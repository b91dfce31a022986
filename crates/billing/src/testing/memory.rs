use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use bizpilot_shared::{SubscriptionStatus, SubscriptionTier};

use crate::error::{BillingError, BillingResult};
use crate::store::{
    is_superseded, ActivityEntry, BillingStore, ClaimOutcome, CustomerLookup, EventClaim,
    PastDueMark, ProcessingResult, RevenueEntry, StoredEvent, SubscriptionActivation,
    SubscriptionCancellation, SubscriptionSync, WriteOutcome, PROCESSING_TIMEOUT_MINUTES,
    RESULT_ERROR, RESULT_FAILED_PERMANENTLY, RESULT_PROCESSING, RESULT_SUCCESS,
    RESULT_SUPERSEDED,
};

/// One [`BillingStore`] method, used to inject failures and inspect calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ClaimEvent,
    FinishEvent,
    LoadEvent,
    FailedEvents,
    FindUserByCustomer,
    ActivateSubscription,
    SyncSubscription,
    CancelSubscription,
    MarkPastDue,
    RecordRevenue,
    LogActivity,
}

impl StoreOp {
    /// Whether the operation writes billing state (the ledger excluded)
    pub fn is_billing_write(&self) -> bool {
        matches!(
            self,
            StoreOp::ActivateSubscription
                | StoreOp::SyncSubscription
                | StoreOp::CancelSubscription
                | StoreOp::MarkPastDue
                | StoreOp::RecordRevenue
                | StoreOp::LogActivity
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRow {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub last_event_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRow {
    pub subscription_tier: String,
    pub subscription_status: Option<SubscriptionStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub payload: serde_json::Value,
    pub processing_started_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    /// Claim order; wall-clock ticks can tie inside one test
    last_claim: u64,
}

#[derive(Default)]
struct State {
    ledger: HashMap<String, LedgerRow>,
    subscriptions: Vec<SubscriptionRow>,
    profiles: HashMap<Uuid, ProfileRow>,
    metrics: Vec<RevenueEntry>,
    activity: Vec<ActivityEntry>,
    calls: Vec<StoreOp>,
    failing: HashSet<StoreOp>,
    claims: u64,
}

/// [`BillingStore`] over in-process tables
///
/// Each write applies its primary row and profile mirror together, so an
/// injected failure leaves both untouched.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a free-tier profile with no subscription
    pub fn with_profile(self, user_id: Uuid) -> Self {
        self.state().profiles.insert(
            user_id,
            ProfileRow {
                subscription_tier: SubscriptionTier::Free.as_str().to_string(),
                subscription_status: None,
            },
        );
        self
    }

    /// Add an active subscription and its mirrored profile
    pub fn with_subscription(self, user_id: Uuid, customer_id: &str, subscription_id: &str) -> Self {
        {
            let mut state = self.state();
            state.subscriptions.push(SubscriptionRow {
                user_id,
                stripe_customer_id: customer_id.to_string(),
                stripe_subscription_id: subscription_id.to_string(),
                plan_id: "starter".to_string(),
                plan_name: "Starter".to_string(),
                status: SubscriptionStatus::Active,
                current_period_start: None,
                current_period_end: None,
                cancel_at: None,
                cancelled_at: None,
                last_event_at: None,
            });
            state.profiles.insert(
                user_id,
                ProfileRow {
                    subscription_tier: SubscriptionTier::Starter.as_str().to_string(),
                    subscription_status: Some(SubscriptionStatus::Active),
                },
            );
        }
        self
    }

    /// Make every later call to `op` fail
    pub fn fail_on(&self, op: StoreOp) {
        self.state().failing.insert(op);
    }

    pub fn recover(&self, op: StoreOp) {
        self.state().failing.remove(&op);
    }

    /// Backdate a ledger row's processing start
    pub fn age_event(&self, event_id: &str, by: Duration) {
        if let Some(row) = self.state().ledger.get_mut(event_id) {
            row.processing_started_at -= by;
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRow> {
        self.state().subscriptions.clone()
    }

    pub fn subscription(&self, user_id: Uuid) -> Option<SubscriptionRow> {
        self.state()
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id)
            .cloned()
    }

    pub fn profile(&self, user_id: Uuid) -> Option<ProfileRow> {
        self.state().profiles.get(&user_id).cloned()
    }

    pub fn metrics(&self) -> Vec<RevenueEntry> {
        self.state().metrics.clone()
    }

    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.state().activity.clone()
    }

    pub fn ledger(&self, event_id: &str) -> Option<LedgerRow> {
        self.state().ledger.get(event_id).cloned()
    }

    /// Every call made so far, failed ones included
    pub fn calls(&self) -> Vec<StoreOp> {
        self.state().calls.clone()
    }

    pub fn was_called(&self, op: StoreOp) -> bool {
        self.state().calls.contains(&op)
    }

    /// Billing writes attempted so far
    pub fn billing_writes(&self) -> Vec<StoreOp> {
        self.state()
            .calls
            .iter()
            .copied()
            .filter(StoreOp::is_billing_write)
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, op: StoreOp) -> BillingResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(op);
        if state.failing.contains(&op) {
            return Err(BillingError::Database(format!("injected failure in {:?}", op)));
        }
        Ok(state)
    }
}

/// The subscription row matching `find`, unless a newer event already wrote it
fn ordered_row<'a>(
    state: &'a mut State,
    event_at: OffsetDateTime,
    find: impl Fn(&SubscriptionRow) -> bool,
) -> Result<Option<&'a mut SubscriptionRow>, WriteOutcome> {
    match state.subscriptions.iter_mut().find(|s| find(s)) {
        Some(row) if is_superseded(row.last_event_at, event_at) => Err(WriteOutcome::Stale),
        row => Ok(row),
    }
}

fn mirror_status(state: &mut State, user_id: Uuid, status: SubscriptionStatus) {
    if let Some(profile) = state.profiles.get_mut(&user_id) {
        profile.subscription_status = Some(status);
    }
}

fn stored(event_id: &str, row: &LedgerRow) -> StoredEvent {
    StoredEvent {
        stripe_event_id: event_id.to_string(),
        event_type: row.event_type.clone(),
        processing_result: row.processing_result.clone(),
        error_message: row.error_message.clone(),
        attempts: row.attempts,
        payload: row.payload.clone(),
        created_at: row.created_at,
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<ClaimOutcome> {
        let mut state = self.enter(StoreOp::ClaimEvent)?;
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES));
        state.claims += 1;
        let seq = state.claims;

        match state.ledger.get_mut(claim.event_id) {
            None => {
                state.ledger.insert(
                    claim.event_id.to_string(),
                    LedgerRow {
                        event_type: claim.event_type.to_string(),
                        processing_result: RESULT_PROCESSING.to_string(),
                        error_message: None,
                        attempts: 1,
                        payload: claim.payload.clone(),
                        processing_started_at: now,
                        created_at: now,
                        last_claim: seq,
                    },
                );
                Ok(ClaimOutcome::Claimed { attempt: 1 })
            }
            Some(row) => {
                let reclaimable = row.processing_result == RESULT_ERROR
                    || (row.processing_result == RESULT_PROCESSING
                        && row.processing_started_at < stuck_before);

                if reclaimable {
                    row.error_message = Some(format!("Re-claimed from {}", row.processing_result));
                    row.processing_result = RESULT_PROCESSING.to_string();
                    row.processing_started_at = now;
                    row.payload = claim.payload.clone();
                    row.attempts += 1;
                    row.last_claim = seq;
                    Ok(ClaimOutcome::Claimed {
                        attempt: row.attempts,
                    })
                } else if row.processing_result == RESULT_SUCCESS
                    || row.processing_result == RESULT_SUPERSEDED
                {
                    Ok(ClaimOutcome::AlreadyProcessed)
                } else if row.processing_result == RESULT_FAILED_PERMANENTLY {
                    Ok(ClaimOutcome::Abandoned)
                } else {
                    Ok(ClaimOutcome::InProgress)
                }
            }
        }
    }

    async fn finish_event(&self, event_id: &str, result: &ProcessingResult) -> BillingResult<()> {
        let mut state = self.enter(StoreOp::FinishEvent)?;
        if let Some(row) = state.ledger.get_mut(event_id) {
            row.processing_result = result.as_str().to_string();
            row.error_message = result.error_message().map(str::to_string);
        }
        Ok(())
    }

    async fn load_event(&self, event_id: &str) -> BillingResult<Option<StoredEvent>> {
        let state = self.enter(StoreOp::LoadEvent)?;
        Ok(state.ledger.get(event_id).map(|row| stored(event_id, row)))
    }

    async fn failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>> {
        let state = self.enter(StoreOp::FailedEvents)?;
        let mut failed: Vec<(u64, StoredEvent)> = state
            .ledger
            .iter()
            .filter(|(_, row)| row.processing_result == RESULT_ERROR)
            .map(|(id, row)| (row.last_claim, stored(id, row)))
            .collect();
        failed.sort_by_key(|(last_claim, _)| *last_claim);
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed.into_iter().map(|(_, event)| event).collect())
    }

    async fn find_user_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<CustomerLookup> {
        let state = self.enter(StoreOp::FindUserByCustomer)?;
        let owners: Vec<Uuid> = state
            .subscriptions
            .iter()
            .filter(|s| s.stripe_customer_id == stripe_customer_id)
            .map(|s| s.user_id)
            .collect();

        Ok(match owners.as_slice() {
            [] => CustomerLookup::NotFound,
            [user_id] => CustomerLookup::Found(*user_id),
            many => CustomerLookup::Ambiguous(many.len()),
        })
    }

    async fn activate_subscription(
        &self,
        activation: &SubscriptionActivation,
    ) -> BillingResult<WriteOutcome> {
        let mut state = self.enter(StoreOp::ActivateSubscription)?;

        let row = SubscriptionRow {
            user_id: activation.user_id,
            stripe_customer_id: activation.stripe_customer_id.clone(),
            stripe_subscription_id: activation.stripe_subscription_id.clone(),
            plan_id: activation.plan_id.clone(),
            plan_name: activation.plan_name.clone(),
            status: SubscriptionStatus::Active,
            current_period_start: activation.current_period_start,
            current_period_end: activation.current_period_end,
            cancel_at: None,
            cancelled_at: None,
            last_event_at: Some(activation.event_at),
        };

        match ordered_row(&mut state, activation.event_at, |s| {
            s.user_id == activation.user_id
        }) {
            Err(stale) => return Ok(stale),
            Ok(Some(existing)) => *existing = row,
            Ok(None) => state.subscriptions.push(row),
        }

        if let Some(profile) = state.profiles.get_mut(&activation.user_id) {
            profile.subscription_tier = activation.plan_id.clone();
            profile.subscription_status = Some(SubscriptionStatus::Active);
        }

        Ok(WriteOutcome::Applied)
    }

    async fn sync_subscription(&self, sync: &SubscriptionSync) -> BillingResult<WriteOutcome> {
        let mut state = self.enter(StoreOp::SyncSubscription)?;

        match ordered_row(&mut state, sync.event_at, |s| {
            s.stripe_subscription_id == sync.stripe_subscription_id
        }) {
            Err(stale) => return Ok(stale),
            Ok(Some(row)) => {
                row.status = sync.status;
                row.current_period_start = sync.current_period_start.or(row.current_period_start);
                row.current_period_end = sync.current_period_end.or(row.current_period_end);
                row.cancel_at = sync.cancel_at;
                row.cancelled_at = sync.cancelled_at;
                row.last_event_at = Some(sync.event_at);
            }
            Ok(None) => {}
        }
        mirror_status(&mut state, sync.user_id, sync.status);

        Ok(WriteOutcome::Applied)
    }

    async fn cancel_subscription(
        &self,
        cancellation: &SubscriptionCancellation,
    ) -> BillingResult<WriteOutcome> {
        let mut state = self.enter(StoreOp::CancelSubscription)?;

        match ordered_row(&mut state, cancellation.event_at, |s| {
            s.stripe_subscription_id == cancellation.stripe_subscription_id
        }) {
            Err(stale) => return Ok(stale),
            Ok(Some(row)) => {
                row.status = SubscriptionStatus::Canceled;
                row.cancelled_at = Some(cancellation.cancelled_at);
                row.last_event_at = Some(cancellation.event_at);
            }
            Ok(None) => {}
        }
        if let Some(profile) = state.profiles.get_mut(&cancellation.user_id) {
            profile.subscription_status = Some(SubscriptionStatus::Canceled);
            profile.subscription_tier = SubscriptionTier::Free.as_str().to_string();
        }

        Ok(WriteOutcome::Applied)
    }

    async fn mark_past_due(&self, mark: &PastDueMark) -> BillingResult<WriteOutcome> {
        let mut state = self.enter(StoreOp::MarkPastDue)?;

        match ordered_row(&mut state, mark.event_at, |s| s.user_id == mark.user_id) {
            Err(stale) => return Ok(stale),
            Ok(Some(row)) => {
                row.status = SubscriptionStatus::PastDue;
                row.last_event_at = Some(mark.event_at);
            }
            Ok(None) => {}
        }
        mirror_status(&mut state, mark.user_id, SubscriptionStatus::PastDue);

        Ok(WriteOutcome::Applied)
    }

    async fn record_revenue(&self, entry: &RevenueEntry) -> BillingResult<()> {
        let mut state = self.enter(StoreOp::RecordRevenue)?;
        state.metrics.push(entry.clone());
        Ok(())
    }

    async fn log_activity(&self, entry: &ActivityEntry) -> BillingResult<()> {
        let mut state = self.enter(StoreOp::LogActivity)?;
        state.activity.push(entry.clone());
        Ok(())
    }
}
