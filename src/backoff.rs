// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Named retry policies with per-kind budgets.
//!
//! A [`Backoffer`] is created per logical operation (one commit phase, one
//! read) with a total sleep budget in milliseconds. Each retry site names a
//! [`BackoffConfig`]; the backoffer tracks sleep per config, enforces the
//! budget, and sleeps with the config's jitter. Server-busy sleeps are
//! "excluded": they have their own cap and do not consume the shared budget
//! until that cap is reached.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::thread_rng;
use rand::Rng;
use thiserror::Error;

const TXN_LOCK_FAST_NAME: &str = "txnLockFast";

/// Total sleep cap for server-busy backoff, beyond which it also fails.
const SERVER_BUSY_EXCLUDED_MAX_MS: u64 = 600_000;

/// Sleep budgets of the commit phases. Expressed here rather than as wall
/// deadlines so that time spent inside RPCs does not count against retries.
pub const PREWRITE_MAX_BACKOFF_MS: u64 = 600_000;
pub const COMMIT_MAX_BACKOFF_MS: u64 = 600_000;
pub const CLEANUP_MAX_BACKOFF_MS: u64 = 20_000;
pub const PESSIMISTIC_LOCK_MAX_BACKOFF_MS: u64 = 600_000;
pub const PESSIMISTIC_ROLLBACK_MAX_BACKOFF_MS: u64 = 20_000;
pub const GET_MAX_BACKOFF_MS: u64 = 20_000;
pub const SCAN_MAX_BACKOFF_MS: u64 = 20_000;
pub const GC_RESOLVE_LOCK_MAX_BACKOFF_MS: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Jitter {
    NoJitter,
    FullJitter,
    EqualJitter,
    DecorrJitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackoffErrorKind {
    StoreTimeout,
    ResolveLockTimeout,
    RegionUnavailable,
    RegionNotInitialized,
    RegionRecoveryInProgress,
    ServerBusy,
    PdTimeout,
}

impl std::fmt::Display for BackoffErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffErrorKind::StoreTimeout => "store server timeout",
            BackoffErrorKind::ResolveLockTimeout => "resolve lock timeout",
            BackoffErrorKind::RegionUnavailable => "region unavailable",
            BackoffErrorKind::RegionNotInitialized => "region not initialized",
            BackoffErrorKind::RegionRecoveryInProgress => "region recovery in progress",
            BackoffErrorKind::ServerBusy => "server busy",
            BackoffErrorKind::PdTimeout => "pd server timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackofferError {
    /// The operation's context was canceled mid-retry.
    #[error("canceled: {message}")]
    Canceled { message: String },
    /// The sleep budget ran out. Reports the dominant (longest slept,
    /// non-excluded) backoff kind.
    #[error("{kind}")]
    MaxSleepExceeded { kind: BackoffErrorKindRepr },
    /// The budget ran out with only excluded sleeps recorded.
    #[error("{message}")]
    Other { message: String },
}

/// Public, displayable form of [`BackoffErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffErrorKindRepr(pub(crate) BackoffErrorKind);

impl std::fmt::Display for BackoffErrorKindRepr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    name: &'static str,
    base_ms: u64,
    cap_ms: u64,
    jitter: Jitter,
    err_kind: BackoffErrorKind,
}

impl BackoffConfig {
    const fn new(
        name: &'static str,
        base_ms: u64,
        cap_ms: u64,
        jitter: Jitter,
        err_kind: BackoffErrorKind,
    ) -> Self {
        Self {
            name,
            base_ms,
            cap_ms,
            jitter,
            err_kind,
        }
    }

    /// The policy's name, as it appears in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Transport-level retries against a store node.
pub const BO_STORE_RPC: BackoffConfig = BackoffConfig::new(
    "storeRPC",
    100,
    2000,
    Jitter::EqualJitter,
    BackoffErrorKind::StoreTimeout,
);

/// The cached region is stale; wait for routing to converge.
pub const BO_REGION_MISS: BackoffConfig = BackoffConfig::new(
    "regionMiss",
    2,
    500,
    Jitter::NoJitter,
    BackoffErrorKind::RegionUnavailable,
);

/// Retries against the placement driver.
pub const BO_PD_RPC: BackoffConfig = BackoffConfig::new(
    "pdRPC",
    500,
    3000,
    Jitter::EqualJitter,
    BackoffErrorKind::PdTimeout,
);

/// A write blocked on another transaction's lock.
pub const BO_TXN_LOCK: BackoffConfig = BackoffConfig::new(
    "txnLock",
    100,
    3000,
    Jitter::EqualJitter,
    BackoffErrorKind::ResolveLockTimeout,
);

/// A read blocked on another transaction's lock.
pub const BO_TXN_LOCK_FAST: BackoffConfig = BackoffConfig::new(
    TXN_LOCK_FAST_NAME,
    2,
    3000,
    Jitter::EqualJitter,
    BackoffErrorKind::ResolveLockTimeout,
);

pub const BO_TXN_NOT_FOUND: BackoffConfig = BackoffConfig::new(
    "txnNotFound",
    2,
    500,
    Jitter::NoJitter,
    BackoffErrorKind::ResolveLockTimeout,
);

pub const BO_SERVER_BUSY: BackoffConfig = BackoffConfig::new(
    "serverBusy",
    2000,
    10_000,
    Jitter::EqualJitter,
    BackoffErrorKind::ServerBusy,
);

pub const BO_REGION_RECOVERY: BackoffConfig = BackoffConfig::new(
    "regionRecovery",
    100,
    10_000,
    Jitter::EqualJitter,
    BackoffErrorKind::RegionRecoveryInProgress,
);

pub const BO_REGION_NOT_INITIALIZED: BackoffConfig = BackoffConfig::new(
    "regionNotInitialized",
    2,
    1000,
    Jitter::NoJitter,
    BackoffErrorKind::RegionNotInitialized,
);

pub const BO_MAX_TS_NOT_SYNCED: BackoffConfig = BackoffConfig::new(
    "maxTsNotSynced",
    2,
    500,
    Jitter::NoJitter,
    BackoffErrorKind::StoreTimeout,
);

fn excluded_sleep_limit_ms(cfg_name: &str) -> Option<u64> {
    if cfg_name == BO_SERVER_BUSY.name {
        return Some(SERVER_BUSY_EXCLUDED_MAX_MS);
    }
    None
}

/// Runtime-tunable knobs shared by all backoffers of a client.
#[derive(Debug, Clone)]
pub struct BackofferVars {
    /// Base sleep for `txnLockFast`; tuned down by latency-sensitive callers.
    pub backoff_lock_fast_ms: u64,
    /// Budget multiplier applied to every backoffer.
    pub backoff_weight: u64,
}

impl Default for BackofferVars {
    fn default() -> Self {
        Self {
            backoff_lock_fast_ms: 10,
            backoff_weight: 2,
        }
    }
}

#[derive(Debug)]
struct BackoffFnState {
    base_ms: u64,
    cap_ms: u64,
    jitter: Jitter,
    attempts: u32,
    last_sleep_ms: u64,
}

impl BackoffFnState {
    fn new(base_ms: u64, cap_ms: u64, jitter: Jitter) -> Self {
        // Keep jitter helpers' ranges non-empty.
        let base_ms = base_ms.max(2);
        let cap_ms = cap_ms.max(base_ms);
        Self {
            base_ms,
            cap_ms,
            jitter,
            attempts: 0,
            last_sleep_ms: base_ms,
        }
    }

    fn next_sleep_ms(&mut self, max_sleep_ms: Option<u64>) -> u64 {
        let sleep_ms = match self.jitter {
            Jitter::NoJitter => expo(self.base_ms, self.cap_ms, self.attempts),
            Jitter::FullJitter => {
                let v = expo(self.base_ms, self.cap_ms, self.attempts);
                thread_rng().gen_range(0..v)
            }
            Jitter::EqualJitter => {
                let v = expo(self.base_ms, self.cap_ms, self.attempts);
                let half = v / 2;
                half + thread_rng().gen_range(0..half.max(1))
            }
            Jitter::DecorrJitter => {
                let upper = self
                    .last_sleep_ms
                    .saturating_mul(3)
                    .saturating_sub(self.base_ms)
                    .max(1);
                (self.base_ms + thread_rng().gen_range(0..upper)).min(self.cap_ms)
            }
        };
        self.attempts += 1;
        self.last_sleep_ms = sleep_ms;
        max_sleep_ms.map_or(sleep_ms, |max| sleep_ms.min(max))
    }
}

fn expo(base_ms: u64, cap_ms: u64, attempts: u32) -> u64 {
    let mul = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    base_ms.saturating_mul(mul).min(cap_ms)
}

#[derive(Debug)]
struct BackoffContextInner {
    parent: Option<Arc<BackoffContextInner>>,
    canceled: AtomicBool,
}

/// A cancelable context shared between a backoffer and its forks.
/// Cancellation is observed before each sleep.
#[derive(Debug, Clone)]
pub struct BackoffContext {
    inner: Arc<BackoffContextInner>,
}

impl BackoffContext {
    pub fn new() -> (Self, BackoffCancel) {
        let inner = Arc::new(BackoffContextInner {
            parent: None,
            canceled: AtomicBool::new(false),
        });
        (
            Self {
                inner: inner.clone(),
            },
            BackoffCancel { inner },
        )
    }

    fn with_cancel(&self) -> (Self, BackoffCancel) {
        let inner = Arc::new(BackoffContextInner {
            parent: Some(self.inner.clone()),
            canceled: AtomicBool::new(false),
        });
        (
            Self {
                inner: inner.clone(),
            },
            BackoffCancel { inner },
        )
    }

    pub fn is_canceled(&self) -> bool {
        let mut cursor = Some(self.inner.clone());
        while let Some(inner) = cursor {
            if inner.canceled.load(Ordering::Relaxed) {
                return true;
            }
            cursor = inner.parent.clone();
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct BackoffCancel {
    inner: Arc<BackoffContextInner>,
}

impl BackoffCancel {
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Relaxed);
    }
}

/// A retry budget with total-sleep cap and excluded-sleep buckets.
#[derive(Debug)]
pub struct Backoffer {
    ctx: BackoffContext,
    max_sleep_ms: u64,
    total_sleep_ms: u64,
    excluded_sleep_ms: u64,

    vars: BackofferVars,
    /// A noop backoffer never sleeps; the first backoff request fails.
    noop: bool,

    errors: Vec<String>,
    configs: Vec<BackoffConfig>,
    backoff_sleep_ms: HashMap<&'static str, u64>,
    backoff_times: HashMap<&'static str, u64>,

    fns: HashMap<&'static str, BackoffFnState>,
}

impl Backoffer {
    pub fn new(ctx: BackoffContext, max_sleep_ms: u64) -> Self {
        Self::new_with_vars(ctx, max_sleep_ms, BackofferVars::default())
    }

    /// A backoffer that fails on the first backoff request without sleeping.
    pub fn new_noop(ctx: BackoffContext) -> Self {
        let mut b = Self::new_with_vars(ctx, 0, BackofferVars::default());
        b.noop = true;
        b
    }

    pub fn new_with_vars(ctx: BackoffContext, max_sleep_ms: u64, vars: BackofferVars) -> Self {
        let max_sleep_ms = max_sleep_ms.saturating_mul(vars.backoff_weight);
        Self {
            ctx,
            max_sleep_ms,
            total_sleep_ms: 0,
            excluded_sleep_ms: 0,
            vars,
            noop: false,
            errors: Vec::new(),
            configs: Vec::new(),
            backoff_sleep_ms: HashMap::new(),
            backoff_times: HashMap::new(),
            fns: HashMap::new(),
        }
    }

    /// A fork shares the consumed budget but gets its own cancel scope, for
    /// concurrent batches of one logical operation.
    pub fn fork(&self) -> (Self, BackoffCancel) {
        let (ctx, cancel) = self.ctx.with_cancel();
        (
            Self {
                ctx,
                max_sleep_ms: self.max_sleep_ms,
                total_sleep_ms: self.total_sleep_ms,
                excluded_sleep_ms: self.excluded_sleep_ms,
                vars: self.vars.clone(),
                noop: self.noop,
                errors: self.errors.clone(),
                configs: self.configs.clone(),
                backoff_sleep_ms: self.backoff_sleep_ms.clone(),
                backoff_times: self.backoff_times.clone(),
                fns: HashMap::new(),
            },
            cancel,
        )
    }

    pub fn total_sleep_ms(&self) -> u64 {
        self.total_sleep_ms
    }

    pub fn context(&self) -> &BackoffContext {
        &self.ctx
    }

    fn longest_sleep_cfg(&self) -> Option<(BackoffConfig, u64)> {
        let mut candidate = None::<(&'static str, u64)>;
        for (&name, &sleep_ms) in &self.backoff_sleep_ms {
            if excluded_sleep_limit_ms(name).is_some() {
                continue;
            }
            if candidate.map_or(true, |(_, best)| sleep_ms > best) {
                candidate = Some((name, sleep_ms));
            }
        }
        let (candidate_name, sleep_ms) = candidate?;
        let cfg = self
            .configs
            .iter()
            .copied()
            .find(|cfg| cfg.name == candidate_name)?;
        Some((cfg, sleep_ms))
    }

    /// Sleeps according to `cfg`, consuming budget. Fails when the context is
    /// canceled or the budget runs out.
    pub async fn backoff(
        &mut self,
        cfg: &BackoffConfig,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        self.backoff_with_max_sleep(cfg, None, err_message).await
    }

    /// Like [`Self::backoff`] but caps this single sleep, used to wait no
    /// longer than a lock's remaining TTL.
    pub async fn backoff_with_max_sleep(
        &mut self,
        cfg: &BackoffConfig,
        max_sleep_ms: Option<u64>,
        err_message: impl Into<String>,
    ) -> Result<(), BackofferError> {
        let sleep_ms = self.prepare_sleep(cfg, max_sleep_ms, err_message)?;
        if sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        Ok(())
    }

    /// Budget accounting without the sleep itself; returns how long to sleep.
    fn prepare_sleep(
        &mut self,
        cfg: &BackoffConfig,
        max_sleep_ms: Option<u64>,
        err_message: impl Into<String>,
    ) -> Result<u64, BackofferError> {
        let err_message = err_message.into();

        if self.ctx.is_canceled() {
            return Err(BackofferError::Canceled {
                message: err_message,
            });
        }
        if self.noop {
            return Err(BackofferError::Other {
                message: err_message,
            });
        }

        let max_backoff_time_exceeded = self.max_sleep_ms > 0
            && (self.total_sleep_ms - self.excluded_sleep_ms) >= self.max_sleep_ms;
        let max_excluded_time_exceeded = excluded_sleep_limit_ms(cfg.name).is_some_and(|limit| {
            self.excluded_sleep_ms >= limit && self.excluded_sleep_ms >= self.max_sleep_ms
        });

        if self.max_sleep_ms > 0 && (max_backoff_time_exceeded || max_excluded_time_exceeded) {
            return match self.longest_sleep_cfg() {
                Some((cfg, _)) => Err(BackofferError::MaxSleepExceeded {
                    kind: BackoffErrorKindRepr(cfg.err_kind),
                }),
                None => Err(BackofferError::Other {
                    message: err_message,
                }),
            };
        }

        debug!("backoff {}: {}", cfg.name, err_message);
        self.errors.push(err_message);
        self.configs.push(*cfg);

        let base_ms = if cfg.name == TXN_LOCK_FAST_NAME {
            self.vars.backoff_lock_fast_ms
        } else {
            cfg.base_ms
        };
        let state = self
            .fns
            .entry(cfg.name)
            .or_insert_with(|| BackoffFnState::new(base_ms, cfg.cap_ms, cfg.jitter));
        let real_sleep_ms = state.next_sleep_ms(max_sleep_ms);

        self.total_sleep_ms += real_sleep_ms;
        if excluded_sleep_limit_ms(cfg.name).is_some() {
            self.excluded_sleep_ms += real_sleep_ms;
        }
        *self.backoff_sleep_ms.entry(cfg.name).or_default() += real_sleep_ms;
        *self.backoff_times.entry(cfg.name).or_default() += 1;

        Ok(real_sleep_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoffer(max_sleep_ms: u64) -> Backoffer {
        let (ctx, _cancel) = BackoffContext::new();
        Backoffer::new_with_vars(
            ctx,
            max_sleep_ms,
            BackofferVars {
                backoff_lock_fast_ms: 2,
                backoff_weight: 1,
            },
        )
    }

    #[tokio::test]
    async fn backoff_with_max_sleep_caps_the_sleep() {
        let mut b = backoffer(2000);
        b.backoff_with_max_sleep(&BO_TXN_LOCK_FAST, Some(5), "test")
            .await
            .unwrap();
        assert!(b.total_sleep_ms() <= 5);
    }

    #[tokio::test]
    async fn exhaustion_reports_longest_sleep_kind() {
        let mut b = backoffer(800);
        b.backoff(&BO_REGION_MISS, "region miss").await.unwrap();
        for _ in 0..2 {
            b.backoff(&BO_REGION_NOT_INITIALIZED, "not initialized")
                .await
                .unwrap();
        }
        b.backoff(&BO_REGION_RECOVERY, "recovery in progress")
            .await
            .unwrap();
        // Excluded sleep does not count towards the budget.
        b.backoff(&BO_SERVER_BUSY, "server is busy").await.unwrap();

        for _ in 0..20 {
            match b.backoff(&BO_TXN_NOT_FOUND, "txn not found").await {
                Ok(()) => {}
                Err(e) => {
                    let (cfg, _) = b.longest_sleep_cfg().expect("longest-sleep cfg");
                    assert_eq!(
                        e,
                        BackofferError::MaxSleepExceeded {
                            kind: BackoffErrorKindRepr(cfg.err_kind)
                        }
                    );
                    return;
                }
            }
        }
        panic!("expected the backoff to exceed max sleep");
    }

    #[tokio::test]
    async fn fork_shares_budget_and_separate_cancel() {
        let mut b = backoffer(8);
        for _ in 0..3 {
            b.backoff(&BO_REGION_NOT_INITIALIZED, "not initialized")
                .await
                .unwrap();
        }
        let (mut forked, cancel) = b.fork();
        forked.backoff(&BO_STORE_RPC, "store rpc").await.unwrap_err();

        cancel.cancel();
        let err = forked.backoff(&BO_STORE_RPC, "store rpc").await.unwrap_err();
        assert!(matches!(err, BackofferError::Canceled { .. }));
        // The parent context is unaffected by the fork's cancel.
        assert!(!b.context().is_canceled());
    }

    #[tokio::test]
    async fn noop_backoffer_fails_without_sleeping() {
        let (ctx, _cancel) = BackoffContext::new();
        let mut b = Backoffer::new_noop(ctx);
        let e = b.backoff(&BO_REGION_MISS, "region miss").await.unwrap_err();
        assert!(matches!(e, BackofferError::Other { .. }));
        assert_eq!(b.total_sleep_ms(), 0);
    }

    #[test]
    fn jitters_are_bounded() {
        let mut full = BackoffFnState::new(2, 7, Jitter::FullJitter);
        assert!(full.next_sleep_ms(None) <= 7);

        let mut decorr = BackoffFnState::new(2, 7, Jitter::DecorrJitter);
        let v = decorr.next_sleep_ms(None);
        assert!((2..=7).contains(&v));
    }

    #[tokio::test]
    async fn cancellation_observed_through_parents() {
        let (ctx, cancel) = BackoffContext::new();
        let mut b = Backoffer::new(ctx, 1000);
        cancel.cancel();
        let e = b.backoff(&BO_PD_RPC, "pd down").await.unwrap_err();
        assert!(matches!(e, BackofferError::Canceled { .. }));
    }
}
