//! Periodic recovery sweeps (§4.3): swaps stuck in `Failed` or past
//! their timelock are retried a bounded number of times before being
//! left for manual intervention. [`sweep_expired_refunds`] handles the
//! refund half; [`sweep_failed_claims`] re-attempts the claim path for
//! `Failed` swaps whose secret is already known and whose timelock has
//! not yet elapsed.

use super::{SwapEngine, SwapState};
use shared::Result;

/// Recovery gives up on a swap after this many automated attempts,
/// matching `auto_recovery_attempts` tracked on each contract.
pub const MAX_ATTEMPTS: u32 = 5;

/// The outcome of a single recovery sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub refunded: u32,
    pub exhausted: u32,
}

/// Walks every tracked swap and refunds those whose timelock has
/// elapsed and which have not already reached [`MAX_ATTEMPTS`] recovery
/// attempts. Intended to be called on a fixed interval by the node's
/// background task scheduler.
///
/// # Errors
///
/// Returns an error only if persistence fails after a successful
/// refund; individual refund failures are counted in the report rather
/// than propagated, since one stuck swap should not block the sweep.
pub fn sweep_expired_refunds(engine: &mut SwapEngine, now: i64) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let due: Vec<_> = engine
        .all()
        .into_iter()
        .filter(|swap| {
            matches!(swap.state, SwapState::Funded | SwapState::CounterpartyFunded | SwapState::Failed)
                && now >= swap.timelock_unix
                && swap.auto_recovery_attempts < MAX_ATTEMPTS
        })
        .map(|swap| swap.swap_id)
        .collect();

    for swap_id in due {
        match engine.refund(swap_id, now) {
            Ok(_) => report.refunded += 1,
            Err(_) => {
                let attempts = engine.bump_recovery_attempt(swap_id)?;
                if attempts >= MAX_ATTEMPTS {
                    report.exhausted += 1;
                }
            }
        }
    }

    Ok(report)
}

/// The outcome of a single claim-recovery sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClaimSweepReport {
    pub claimed: u32,
    pub exhausted: u32,
}

/// Walks every `Failed` swap whose timelock has not yet elapsed and
/// whose secret is already known (revealed by a prior local claim
/// attempt or observed on the counterparty chain), and re-attempts the
/// claim path. Swaps without a known secret are left untouched — they
/// fall to [`sweep_expired_refunds`] once their timelock elapses.
/// Intended to run on a fixed interval alongside the refund sweep.
///
/// # Errors
///
/// Returns an error only if persistence fails after a successful
/// claim; individual claim failures are counted in the report rather
/// than propagated, since one stuck swap should not block the sweep.
pub fn sweep_failed_claims(engine: &mut SwapEngine, now: i64) -> Result<ClaimSweepReport> {
    let mut report = ClaimSweepReport::default();

    let candidates: Vec<_> = engine
        .all()
        .into_iter()
        .filter(|swap| {
            swap.state == SwapState::Failed && now < swap.timelock_unix && swap.auto_recovery_attempts < MAX_ATTEMPTS
        })
        .map(|swap| (swap.swap_id, swap.known_secret()))
        .collect();

    for (swap_id, secret) in candidates {
        let Some(secret) = secret else {
            continue;
        };

        match engine.claim(swap_id, &secret, now) {
            Ok(_) => report.claimed += 1,
            Err(_) => {
                let attempts = engine.bump_recovery_attempt(swap_id)?;
                if attempts >= MAX_ATTEMPTS {
                    report.exhausted += 1;
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::{CoinType, ExternalEvent};

    #[test]
    fn sweep_refunds_swaps_past_their_timelock() {
        let mut engine = SwapEngine::new();
        let contract = engine
            .create_swap(CoinType::Btc, 1_000, 900, "counterparty".to_string(), 1, None, &[1; 20], &[2; 20], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, shared::Hash256::sha256(b"fund"), 1_700_000_100).unwrap();

        let report = sweep_expired_refunds(&mut engine, 1_700_000_000 + 3601).unwrap();

        assert_eq!(report.refunded, 1);
        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Refunded);
    }

    #[test]
    fn sweep_ignores_swaps_before_timelock_elapses() {
        let mut engine = SwapEngine::new();
        let contract = engine
            .create_swap(CoinType::Btc, 1_000, 900, "counterparty".to_string(), 24, None, &[1; 20], &[2; 20], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, shared::Hash256::sha256(b"fund"), 1_700_000_100).unwrap();

        let report = sweep_expired_refunds(&mut engine, 1_700_000_200).unwrap();

        assert_eq!(report.refunded, 0);
        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Funded);
    }

    #[test]
    fn claim_sweep_recovers_failed_swap_with_a_known_secret() {
        let mut engine = SwapEngine::new();
        let secret = [9u8; 32];
        let contract = engine
            .create_swap(CoinType::Eth, 100, 90, "counterparty".to_string(), 24, Some(secret), &[], &[], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, shared::Hash256::sha256(b"fund"), 1_700_000_100).unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyFunded { funding_txid: shared::Hash256::sha256(b"cp-fund") },
                1_700_000_200,
            )
            .unwrap();
        // The correct secret is observed first, then a conflicting bad
        // reveal drives the swap into Failed, leaving the correct one
        // as the most recent matching history entry.
        engine
            .handle_external_event(contract.swap_id, ExternalEvent::CounterpartyClaimed { revealed_secret: secret.to_vec() }, 1_700_000_250)
            .unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyClaimed { revealed_secret: vec![0u8; 32] },
                1_700_000_300,
            )
            .unwrap();
        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Failed);

        let report = sweep_failed_claims(&mut engine, 1_700_000_400).unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Claimed);
    }

    #[test]
    fn claim_sweep_skips_failed_swap_with_no_known_secret() {
        let mut engine = SwapEngine::new();
        let secret = [9u8; 32];
        let contract = engine
            .create_swap(CoinType::Eth, 100, 90, "counterparty".to_string(), 24, Some(secret), &[], &[], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, shared::Hash256::sha256(b"fund"), 1_700_000_100).unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyFunded { funding_txid: shared::Hash256::sha256(b"cp-fund") },
                1_700_000_200,
            )
            .unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyClaimed { revealed_secret: vec![0u8; 32] },
                1_700_000_300,
            )
            .unwrap();
        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Failed);

        let report = sweep_failed_claims(&mut engine, 1_700_000_400).unwrap();

        assert_eq!(report.claimed, 0);
        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Failed);
    }
}
