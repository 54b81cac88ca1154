//! Fee payment orchestration.
//!
//! A payment is gated by a fixed sequence of checks before anything is
//! written:
//!
//! 1. the payer exists (user-service)
//! 2. the fee exists, belongs to the payer and is unpaid (local)
//! 3. the payer holds an active assignment (parking-service)
//! 4. that assignment is for the fee's space
//!
//! The commit is a guarded update that only succeeds while the fee is still
//! unpaid, so two concurrent payments of the same fee cannot both win. The
//! `FeePaid` event is written to the outbox in the same transaction and sent
//! afterwards; a failed send leaves the payment committed and the event to
//! the reconciliation sweep.

use parkflow_core::environment::Clock;
use parkflow_core::event::{EventDraft, FeePaid};
use parkflow_core::model::{FeeId, FeeRecord, UserId};
use parkflow_core::store::{FeeRepository, Outbox, SettleOutcome, StoreError};
use parkflow_runtime::client::DegradedReason;
use parkflow_runtime::directory::{ParkingDirectoryClient, UserDirectoryClient};
use parkflow_runtime::metrics::PaymentMetrics;
use parkflow_runtime::publisher::EventPublisher;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

/// Why a payment was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// A downstream service could not be asked
    #[error("{service} unavailable: {reason}")]
    DependencyUnavailable {
        /// Which downstream
        service: &'static str,
        /// Why
        reason: String,
    },

    /// user-service does not know the payer
    #[error("Payer {0} not found")]
    PayerNotFound(UserId),

    /// No such fee
    #[error("Fee {0} not found")]
    FeeNotFound(FeeId),

    /// The fee belongs to someone else
    #[error("Fee {fee_id} does not belong to user {payer}")]
    NotOwner {
        /// Fee requested
        fee_id: FeeId,
        /// Who tried to pay it
        payer: UserId,
    },

    /// The fee was paid already, possibly by a concurrent attempt
    #[error("Fee {0} is already paid")]
    AlreadyPaid(FeeId),

    /// The payer holds no parking space
    #[error("User {0} has no active parking assignment")]
    NoActiveAssignment(UserId),

    /// The payer's space is not the one the fee covers
    #[error("Fee {fee_id} is for a different parking space than the active assignment")]
    RecordMismatch {
        /// Fee requested
        fee_id: FeeId,
    },

    /// Datastore failure
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl PaymentError {
    /// Stable reason code, used in logs and the `fee_payments_total` metric.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::DependencyUnavailable { .. } => "dependency_unavailable",
            Self::PayerNotFound(_) => "payer_not_found",
            Self::FeeNotFound(_) => "fee_not_found",
            Self::NotOwner { .. } => "not_owner",
            Self::AlreadyPaid(_) => "already_paid",
            Self::NoActiveAssignment(_) => "no_active_assignment",
            Self::RecordMismatch { .. } => "record_mismatch",
            Self::Storage(_) => "storage",
        }
    }
}

/// A committed payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidFee {
    /// The fee as settled
    pub fee: FeeRecord,
    /// Identity of the `FeePaid` event
    pub event_id: Uuid,
}

/// Runs the payment checks and commits the payment.
#[derive(Clone)]
pub struct FeePaymentOrchestrator {
    fees: Arc<dyn FeeRepository>,
    outbox: Arc<dyn Outbox>,
    users: UserDirectoryClient,
    parking: ParkingDirectoryClient,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
}

impl FeePaymentOrchestrator {
    /// Orchestrator over its collaborators.
    #[must_use]
    pub fn new(
        fees: Arc<dyn FeeRepository>,
        outbox: Arc<dyn Outbox>,
        users: UserDirectoryClient,
        parking: ParkingDirectoryClient,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fees,
            outbox,
            users,
            parking,
            publisher,
            clock,
        }
    }

    /// user-service client.
    #[must_use]
    pub const fn users(&self) -> &UserDirectoryClient {
        &self.users
    }

    /// parking-service client.
    #[must_use]
    pub const fn parking(&self) -> &ParkingDirectoryClient {
        &self.parking
    }

    /// Pay `fee_id` on behalf of `payer`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`PaymentError`]; nothing is written
    /// unless every check passes.
    pub async fn pay_fee(
        &self,
        fee_id: FeeId,
        payer: UserId,
        correlation_id: Option<&str>,
    ) -> Result<PaidFee, PaymentError> {
        let span = tracing::info_span!("pay_fee", fee_id = %fee_id, user_id = %payer);
        let result = self.attempt(fee_id, payer, correlation_id).instrument(span).await;

        match &result {
            Ok(paid) => {
                PaymentMetrics::record_outcome("paid");
                tracing::info!(fee_id = %fee_id, user_id = %payer, event_id = %paid.event_id, "Fee paid");
            }
            Err(e) if matches!(e, PaymentError::Storage(_) | PaymentError::DependencyUnavailable { .. }) => {
                PaymentMetrics::record_outcome(e.reason());
                tracing::warn!(fee_id = %fee_id, user_id = %payer, reason = e.reason(), error = %e, "Payment failed");
            }
            Err(e) => {
                PaymentMetrics::record_outcome(e.reason());
                tracing::info!(fee_id = %fee_id, user_id = %payer, reason = e.reason(), "Payment refused");
            }
        }
        result
    }

    async fn attempt(
        &self,
        fee_id: FeeId,
        payer: UserId,
        correlation_id: Option<&str>,
    ) -> Result<PaidFee, PaymentError> {
        match self.users.owner(payer, correlation_id).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(DegradedReason::BusinessRejected(_)) => return Err(PaymentError::PayerNotFound(payer)),
            Err(DegradedReason::Unavailable(reason)) => {
                return Err(PaymentError::DependencyUnavailable {
                    service: "user-service",
                    reason,
                });
            }
        }

        let fee = self.fees.find_fee(fee_id).await?.ok_or(PaymentError::FeeNotFound(fee_id))?;
        if fee.user_id != payer {
            return Err(PaymentError::NotOwner { fee_id, payer });
        }
        if fee.is_paid() {
            return Err(PaymentError::AlreadyPaid(fee_id));
        }

        let record = match self.parking.active_record(payer, correlation_id).await {
            Ok(Some(record)) => record,
            Ok(None) | Err(DegradedReason::BusinessRejected(_)) => {
                return Err(PaymentError::NoActiveAssignment(payer));
            }
            Err(DegradedReason::Unavailable(reason)) => {
                return Err(PaymentError::DependencyUnavailable {
                    service: "parking-service",
                    reason,
                });
            }
        };
        if record.park_id != fee.park_id {
            tracing::info!(
                fee_park_id = %fee.park_id,
                assigned_park_id = %record.park_id,
                "Active assignment does not cover the fee's space"
            );
            return Err(PaymentError::RecordMismatch { fee_id });
        }

        let paid_at = self.clock.now();
        let draft = EventDraft::new(FeePaid {
            fee_id,
            user_id: payer,
            park_id: fee.park_id,
            payment_month: fee.billing_month,
            payment_amount: fee.amount,
            payment_time: paid_at,
        });
        let draft = match correlation_id {
            Some(id) => draft.with_correlation_id(id),
            None => draft,
        };
        let event = self.publisher.stamp(draft);

        let settled = match self.fees.settle_fee(fee_id, paid_at, &event).await? {
            SettleOutcome::Settled(fee) => fee,
            SettleOutcome::AlreadyPaid => return Err(PaymentError::AlreadyPaid(fee_id)),
        };

        if let Err(e) = self.publisher.send(&event).await {
            tracing::warn!(
                event_id = %event.event_id,
                error = %e,
                "FeePaid not published; left for reconciliation"
            );
            if let Err(e) = self.outbox.mark_failed(event.event_id, &e.to_string()).await {
                tracing::warn!(event_id = %event.event_id, error = %e, "Failed to mark outbox row failed");
            }
        }

        Ok(PaidFee {
            fee: settled,
            event_id: event.event_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_distinct() {
        let errors = [
            PaymentError::DependencyUnavailable {
                service: "user-service",
                reason: "open".into(),
            },
            PaymentError::PayerNotFound(UserId::new(1)),
            PaymentError::FeeNotFound(FeeId::new(1)),
            PaymentError::NotOwner {
                fee_id: FeeId::new(1),
                payer: UserId::new(2),
            },
            PaymentError::AlreadyPaid(FeeId::new(1)),
            PaymentError::NoActiveAssignment(UserId::new(1)),
            PaymentError::RecordMismatch { fee_id: FeeId::new(1) },
            PaymentError::Storage(StoreError::Unavailable("down".into())),
        ];

        let mut reasons: Vec<_> = errors.iter().map(PaymentError::reason).collect();
        reasons.sort_unstable();
        reasons.dedup();
        assert_eq!(reasons.len(), errors.len());
    }
}
