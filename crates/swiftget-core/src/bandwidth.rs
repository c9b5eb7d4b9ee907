//! Process-wide bandwidth budget shared across downloads.
//!
//! Workers hold bandwidth tokens minted from a shared bytes/sec budget.
//! Allocation is priority-weighted; a periodic rebalance reclaims budget from
//! under-utilised tokens and feeds over-utilised ones. The manager is an
//! injected dependency, not module-level state, and every operation is total:
//! an impossible request yields "no token", never an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::limiter::RateLimiter;

/// Utilisation below this marks a token as reclaimable.
const UNDER_UTILISED: f64 = 0.3;

/// Utilisation above this marks a token as starved.
const OVER_UTILISED: f64 = 1.1;

/// Headroom left on top of observed usage when reclaiming.
const RECLAIM_HEADROOM: f64 = 1.1;

/// EWMA factor for reported usage.
const USAGE_EWMA_ALPHA: f64 = 0.3;

/// Allocation priority; weights drive the fair-share computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn weight(self) -> u64 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 4,
            Self::Critical => 8,
        }
    }
}

/// What kind of consumer holds the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadType {
    UserInitiated,
    Background,
    System,
}

/// Allocation handle minted by the manager. Identity is the id alone: two
/// tokens for the same download are distinct allocations.
#[derive(Debug, Clone)]
pub struct BandwidthToken {
    pub id: u64,
    pub download_id: String,
    pub allocated_bps: u64,
    pub priority: Priority,
    pub download_type: DownloadType,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    /// EWMA of reported usage, bytes/sec.
    pub last_reported_usage: f64,
}

impl BandwidthToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }

    /// Observed usage over allocation; `None` when nothing is allocated.
    pub fn utilization_ratio(&self) -> Option<f64> {
        if self.allocated_bps == 0 {
            return None;
        }
        Some(self.last_reported_usage / self.allocated_bps as f64)
    }
}

impl PartialEq for BandwidthToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BandwidthToken {}

impl std::hash::Hash for BandwidthToken {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

struct Allocation {
    token: BandwidthToken,
    /// Limiter to push rate changes into when the allocation is resized.
    limiter: Option<RateLimiter>,
}

struct PendingRequest {
    requested_bps: u64,
    priority: Priority,
    download_type: DownloadType,
    download_id: String,
    reply: oneshot::Sender<BandwidthToken>,
}

struct ManagerState {
    total_limit: u64,
    allocations: HashMap<u64, Allocation>,
    pending: Vec<PendingRequest>,
}

impl ManagerState {
    fn allocated_sum(&self) -> u64 {
        self.allocations.values().map(|a| a.token.allocated_bps).sum()
    }

    fn available(&self) -> u64 {
        self.total_limit.saturating_sub(self.allocated_sum())
    }

    fn active_weight(&self) -> u64 {
        self.allocations.values().map(|a| a.token.priority.weight()).sum()
    }

    /// Shrink under-utilised allocations of equal-or-lower priority toward
    /// observed usage plus headroom. Returns the bytes/sec reclaimed.
    fn reclaim_from_idle(&mut self, requester: Priority, needed: u64) -> u64 {
        let mut reclaimed = 0u64;
        let mut ids: Vec<u64> = self
            .allocations
            .iter()
            .filter(|(_, a)| {
                // A token that never reported usage is new, not idle.
                a.token.priority <= requester
                    && a.token.last_reported_usage > 0.0
                    && a.token.utilization_ratio().is_some_and(|r| r < UNDER_UTILISED)
            })
            .map(|(id, _)| *id)
            .collect();
        // Take from the lowest priority first.
        ids.sort_by_key(|id| self.allocations[id].token.priority);
        for id in ids {
            if reclaimed >= needed {
                break;
            }
            let alloc = self.allocations.get_mut(&id).expect("id from same map");
            let keep = ((alloc.token.last_reported_usage * RECLAIM_HEADROOM) as u64)
                .min(alloc.token.allocated_bps);
            let give = alloc.token.allocated_bps - keep;
            if give == 0 {
                continue;
            }
            alloc.token.allocated_bps = keep;
            if let Some(limiter) = &alloc.limiter {
                limiter.set_rate(keep);
            }
            reclaimed += give;
        }
        reclaimed
    }

    /// Best-effort grant; the caller mints the token on `Some`.
    fn plan_grant(&mut self, requested_bps: u64, priority: Priority, floor: u64) -> Option<u64> {
        if requested_bps == 0 {
            return None;
        }
        // An unlimited budget grants every request as asked.
        if self.total_limit == 0 {
            return Some(requested_bps);
        }

        let available = self.available();
        if available >= requested_bps {
            return Some(requested_bps);
        }

        let w_new = priority.weight();
        let fair = self.total_limit * w_new / (w_new + self.active_weight());
        let mut grant = requested_bps.min(fair).max(floor);
        if grant > available {
            let deficit = grant - available;
            self.reclaim_from_idle(priority, deficit);
            grant = grant.min(self.available());
        }
        if grant < floor {
            return None;
        }
        Some(grant)
    }
}

/// Shared bandwidth manager. Clone the handle; state is behind one actor lock.
#[derive(Clone)]
pub struct BandwidthManager {
    state: Arc<Mutex<ManagerState>>,
    next_token_id: Arc<AtomicU64>,
    /// Smallest useful allocation; requests that cannot reach it are refused.
    allocation_floor: u64,
}

impl BandwidthManager {
    /// `total_limit_bps` of 0 means unlimited.
    pub fn new(total_limit_bps: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                total_limit: total_limit_bps,
                allocations: HashMap::new(),
                pending: Vec::new(),
            })),
            next_token_id: Arc::new(AtomicU64::new(1)),
            allocation_floor: 16 * 1024,
        }
    }

    fn mint(
        &self,
        granted: u64,
        priority: Priority,
        download_type: DownloadType,
        download_id: &str,
    ) -> BandwidthToken {
        BandwidthToken {
            id: self.next_token_id.fetch_add(1, Ordering::Relaxed),
            download_id: download_id.to_string(),
            allocated_bps: granted,
            priority,
            download_type,
            created_at: Instant::now(),
            expires_at: None,
            last_reported_usage: 0.0,
        }
    }

    /// Request an allocation. Best effort: the grant may be smaller than
    /// asked; `None` means nothing useful could be carved out.
    pub async fn request(
        &self,
        requested_bps: u64,
        priority: Priority,
        download_type: DownloadType,
        download_id: &str,
    ) -> Option<BandwidthToken> {
        let mut st = self.state.lock().await;
        let granted = st.plan_grant(requested_bps, priority, self.allocation_floor)?;
        let token = self.mint(granted, priority, download_type, download_id);
        st.allocations.insert(token.id, Allocation { token: token.clone(), limiter: None });
        Some(token)
    }

    /// Like `request`, but parks in the pending queue until budget frees up.
    /// Waiters are woken by `release` in priority order.
    pub async fn request_waiting(
        &self,
        requested_bps: u64,
        priority: Priority,
        download_type: DownloadType,
        download_id: &str,
    ) -> BandwidthToken {
        let rx = {
            let mut st = self.state.lock().await;
            if let Some(granted) = st.plan_grant(requested_bps, priority, self.allocation_floor) {
                let token = self.mint(granted, priority, download_type, download_id);
                st.allocations
                    .insert(token.id, Allocation { token: token.clone(), limiter: None });
                return token;
            }
            let (tx, rx) = oneshot::channel();
            st.pending.push(PendingRequest {
                requested_bps,
                priority,
                download_type,
                download_id: download_id.to_string(),
                reply: tx,
            });
            rx
        };
        // The sender is only dropped if the manager itself goes away.
        rx.await.expect("bandwidth manager dropped with waiters parked")
    }

    /// Bind the limiter fed by this token so resizes propagate to the worker.
    pub async fn bind_limiter(&self, token_id: u64, limiter: RateLimiter) {
        let mut st = self.state.lock().await;
        if let Some(alloc) = st.allocations.get_mut(&token_id) {
            alloc.limiter = Some(limiter);
        }
    }

    /// Return an allocation to the pool and wake the best pending waiter.
    pub async fn release(&self, token_id: u64) {
        let mut st = self.state.lock().await;
        st.allocations.remove(&token_id);
        self.wake_pending(&mut st);
    }

    fn wake_pending(&self, st: &mut ManagerState) {
        while !st.pending.is_empty() {
            // Highest priority first; FIFO within a priority.
            let best = st
                .pending
                .iter()
                .enumerate()
                .max_by_key(|(i, p)| (p.priority, std::cmp::Reverse(*i)))
                .map(|(i, _)| i)
                .expect("pending not empty");
            let Some(granted) = st.plan_grant(
                st.pending[best].requested_bps,
                st.pending[best].priority,
                self.allocation_floor,
            ) else {
                return;
            };
            let req = st.pending.remove(best);
            let token = self.mint(granted, req.priority, req.download_type, &req.download_id);
            let token_id = token.id;
            st.allocations.insert(token_id, Allocation { token: token.clone(), limiter: None });
            if req.reply.send(token).is_err() {
                // Waiter gave up; put the budget straight back.
                st.allocations.remove(&token_id);
                continue;
            }
        }
    }

    /// Record observed throughput for a token (EWMA-smoothed).
    pub async fn update_usage(&self, token_id: u64, observed_bps: f64) {
        let mut st = self.state.lock().await;
        if let Some(alloc) = st.allocations.get_mut(&token_id) {
            let prev = alloc.token.last_reported_usage;
            alloc.token.last_reported_usage = if prev == 0.0 {
                observed_bps
            } else {
                USAGE_EWMA_ALPHA * observed_bps + (1.0 - USAGE_EWMA_ALPHA) * prev
            };
        }
    }

    /// Move budget from under-utilised tokens to starved ones, highest
    /// priority first. Intended to run on a timer (about every 2 seconds).
    pub async fn rebalance(&self) {
        let mut st = self.state.lock().await;
        if st.total_limit == 0 {
            return;
        }

        let mut starved: Vec<u64> = st
            .allocations
            .iter()
            .filter(|(_, a)| a.token.utilization_ratio().is_some_and(|r| r > OVER_UTILISED))
            .map(|(id, _)| *id)
            .collect();
        if starved.is_empty() {
            return;
        }
        starved.sort_by_key(|id| std::cmp::Reverse(st.allocations[id].token.priority));

        for id in starved {
            let priority = st.allocations[&id].token.priority;
            let want = {
                let t = &st.allocations[&id].token;
                // Grow toward what the worker demonstrably pushes.
                ((t.last_reported_usage * RECLAIM_HEADROOM) as u64)
                    .saturating_sub(t.allocated_bps)
            };
            if want == 0 {
                continue;
            }
            let mut budget = st.available();
            if budget < want {
                budget += st.reclaim_from_idle(priority, want - budget);
            }
            let grant = want.min(budget);
            if grant == 0 {
                continue;
            }
            let alloc = st.allocations.get_mut(&id).expect("starved id exists");
            alloc.token.allocated_bps += grant;
            if let Some(limiter) = &alloc.limiter {
                limiter.set_rate(alloc.token.allocated_bps);
            }
        }
    }

    /// Resize the shared budget. Shrinking below the active sum scales
    /// allocations down proportionally, lowest priority class first.
    pub async fn adjust_limit(&self, new_total_bps: u64) {
        let mut st = self.state.lock().await;
        st.total_limit = new_total_bps;
        if new_total_bps == 0 {
            return;
        }
        let mut excess = st.allocated_sum().saturating_sub(new_total_bps);
        if excess == 0 {
            self.wake_pending(&mut st);
            return;
        }

        for class in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
            if excess == 0 {
                break;
            }
            let ids: Vec<u64> = st
                .allocations
                .iter()
                .filter(|(_, a)| a.token.priority == class)
                .map(|(id, _)| *id)
                .collect();
            let class_sum: u64 = ids.iter().map(|id| st.allocations[id].token.allocated_bps).sum();
            if class_sum == 0 {
                continue;
            }
            let take = excess.min(class_sum);
            for id in ids {
                let alloc = st.allocations.get_mut(&id).expect("id from same map");
                let share = alloc.token.allocated_bps as u128 * take as u128 / class_sum as u128;
                let cut = (share as u64).min(alloc.token.allocated_bps);
                alloc.token.allocated_bps -= cut;
                if let Some(limiter) = &alloc.limiter {
                    limiter.set_rate(alloc.token.allocated_bps);
                }
            }
            excess = st.allocated_sum().saturating_sub(new_total_bps);
        }
    }

    /// Current totals: (limit, allocated). Diagnostic only.
    pub async fn usage(&self) -> (u64, u64) {
        let st = self.state.lock().await;
        (st.total_limit, st.allocated_sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn zero_request_is_refused() {
        let mgr = BandwidthManager::new(10 * MIB);
        assert!(mgr
            .request(0, Priority::Normal, DownloadType::UserInitiated, "d1")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn grants_full_amount_when_available() {
        let mgr = BandwidthManager::new(10 * MIB);
        let token = mgr
            .request(4 * MIB, Priority::Normal, DownloadType::UserInitiated, "d1")
            .await
            .unwrap();
        assert_eq!(token.allocated_bps, 4 * MIB);
        let (limit, used) = mgr.usage().await;
        assert_eq!(limit, 10 * MIB);
        assert_eq!(used, 4 * MIB);
    }

    #[tokio::test]
    async fn contended_grant_is_weighted_fair_share() {
        let mgr = BandwidthManager::new(10 * MIB);
        let _a = mgr
            .request(9 * MIB, Priority::Normal, DownloadType::Background, "a")
            .await
            .unwrap();
        // 1 MiB left; a high-priority request gets its weighted share
        // bounded by what is actually free.
        let b = mgr
            .request(8 * MIB, Priority::High, DownloadType::UserInitiated, "b")
            .await
            .unwrap();
        assert!(b.allocated_bps <= MIB);
        assert!(b.allocated_bps >= 16 * 1024);
    }

    #[tokio::test]
    async fn reclaims_from_idle_lower_priority_peer() {
        let mgr = BandwidthManager::new(10 * MIB);
        let idle = mgr
            .request(9 * MIB, Priority::Low, DownloadType::Background, "idle")
            .await
            .unwrap();
        // Peer barely uses its allocation.
        mgr.update_usage(idle.id, 100_000.0).await;
        let token = mgr
            .request(5 * MIB, Priority::High, DownloadType::UserInitiated, "busy")
            .await
            .unwrap();
        // Weighted share for the newcomer: 10 MiB * 4/(4+1) = 8 MiB,
        // capped by reclamation; must be well above the leftover 1 MiB.
        assert!(token.allocated_bps > MIB, "got {}", token.allocated_bps);
    }

    #[tokio::test]
    async fn release_returns_budget_and_wakes_waiter() {
        let mgr = BandwidthManager::new(2 * MIB);
        let first = mgr
            .request(2 * MIB, Priority::Normal, DownloadType::UserInitiated, "a")
            .await
            .unwrap();
        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            mgr2.request_waiting(MIB, Priority::Normal, DownloadType::UserInitiated, "b")
                .await
        });
        tokio::task::yield_now().await;
        mgr.release(first.id).await;
        let token = waiter.await.unwrap();
        assert_eq!(token.allocated_bps, MIB);
    }

    #[tokio::test]
    async fn shrink_scales_down_low_priority_first() {
        let mgr = BandwidthManager::new(10 * MIB);
        let low = mgr
            .request(5 * MIB, Priority::Low, DownloadType::Background, "low")
            .await
            .unwrap();
        let high = mgr
            .request(5 * MIB, Priority::High, DownloadType::UserInitiated, "high")
            .await
            .unwrap();
        let limiter = RateLimiter::new(low.allocated_bps);
        mgr.bind_limiter(low.id, limiter.clone()).await;

        mgr.adjust_limit(6 * MIB).await;
        let (_, used) = mgr.usage().await;
        assert!(used <= 6 * MIB);
        // The low-priority allocation absorbed the cut and its limiter
        // followed the new rate.
        assert!(limiter.rate() < 5 * MIB);
        let _ = high;
    }

    #[tokio::test]
    async fn rebalance_feeds_starved_token() {
        let mgr = BandwidthManager::new(10 * MIB);
        let idle = mgr
            .request(6 * MIB, Priority::Normal, DownloadType::Background, "idle")
            .await
            .unwrap();
        let starved = mgr
            .request(4 * MIB, Priority::Normal, DownloadType::UserInitiated, "starved")
            .await
            .unwrap();
        let starved_limiter = RateLimiter::new(starved.allocated_bps);
        mgr.bind_limiter(starved.id, starved_limiter.clone()).await;

        mgr.update_usage(idle.id, 200_000.0).await;
        // Pushing well past its allocation.
        mgr.update_usage(starved.id, 4.8 * MIB as f64).await;
        mgr.rebalance().await;

        assert!(starved_limiter.rate() > 4 * MIB);
        let (_, used) = mgr.usage().await;
        assert!(used <= 10 * MIB);
    }

    #[tokio::test]
    async fn token_identity_is_id_only() {
        let mgr = BandwidthManager::new(10 * MIB);
        let a = mgr
            .request(MIB, Priority::Normal, DownloadType::UserInitiated, "same")
            .await
            .unwrap();
        let b = mgr
            .request(MIB, Priority::Normal, DownloadType::UserInitiated, "same")
            .await
            .unwrap();
        assert_ne!(a, b);
        let mut cloned = a.clone();
        cloned.allocated_bps += 1;
        assert_eq!(a, cloned);
    }

    #[tokio::test]
    async fn unlimited_budget_grants_everything() {
        let mgr = BandwidthManager::new(0);
        let t = mgr
            .request(100 * MIB, Priority::Low, DownloadType::Background, "d")
            .await
            .unwrap();
        assert_eq!(t.allocated_bps, 100 * MIB);
    }
}
