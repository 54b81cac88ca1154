//! Event handlers for the fee service's two queues.
//!
//! Both run behind [`MessageProcessor`](parkflow_runtime::MessageProcessor),
//! which supplies decoding, ledger deduplication and settlement; the handlers
//! only map an event to the write it implies.

use async_trait::async_trait;
use parkflow_core::event::{DomainEvent, EventType, FeePaid};
use parkflow_core::model::{BillingMonth, FeeNotification, Money, NewFeeRecord};
use parkflow_core::store::{ApplyOutcome, SideEffect};
use parkflow_runtime::consumer::{HandlerError, IdempotentHandler};

/// Ledger name of the `parking.assigned` consumer.
pub const FEE_ISSUER: &str = "fee-service.fee-issuer";

/// Ledger name of the `fee.paid` consumer.
pub const PAYMENT_NOTIFIER: &str = "fee-service.payment-notifier";

/// Issues the first monthly fee for a new assignment.
///
/// The fee covers the month of the assignment's entry time. A fee that
/// already exists for the same owner, space and month is left alone.
#[derive(Clone, Copy, Debug)]
pub struct FeeIssuer {
    monthly_fee: Money,
}

impl FeeIssuer {
    /// Issuer charging `monthly_fee` per month.
    #[must_use]
    pub const fn new(monthly_fee: Money) -> Self {
        Self { monthly_fee }
    }
}

#[async_trait]
impl IdempotentHandler for FeeIssuer {
    fn consumer_name(&self) -> &str {
        FEE_ISSUER
    }

    fn event_type(&self) -> EventType {
        EventType::AssignmentCreated
    }

    fn side_effect(&self, event: &DomainEvent) -> Result<SideEffect, HandlerError> {
        let assigned = event
            .as_assignment_created()
            .ok_or_else(|| HandlerError::Permanent(format!("expected AssignmentCreated, got {}", event.event_type())))?;

        Ok(SideEffect::CreateFee(NewFeeRecord {
            user_id: assigned.user_id,
            park_id: assigned.park_id,
            billing_month: BillingMonth::from_datetime(assigned.entry_time),
            amount: self.monthly_fee,
        }))
    }

    async fn on_applied(&self, event: &DomainEvent, outcome: &ApplyOutcome) {
        let Some(assigned) = event.as_assignment_created() else {
            return;
        };
        let month = BillingMonth::from_datetime(assigned.entry_time);
        match outcome {
            ApplyOutcome::Applied => tracing::info!(
                event_id = %event.event_id,
                user_id = %assigned.user_id,
                park_id = %assigned.park_id,
                month = %month,
                amount = %self.monthly_fee,
                "Monthly fee issued"
            ),
            ApplyOutcome::AlreadySatisfied => tracing::info!(
                event_id = %event.event_id,
                user_id = %assigned.user_id,
                park_id = %assigned.park_id,
                month = %month,
                "Fee for this month already exists"
            ),
            ApplyOutcome::AlreadyProcessed => {}
        }
    }
}

/// Records the "payment received" notice for a paid fee.
#[derive(Clone, Copy, Debug, Default)]
pub struct PaymentNotifier;

impl PaymentNotifier {
    /// Notice text for a payment.
    #[must_use]
    pub fn render(paid: &FeePaid) -> String {
        format!(
            "[Parking] Payment received\n\
             Dear owner (ID: {}),\n\
             your parking fee for {} of {} has been paid.\n\
             Paid at: {}\n\
             Thank you.",
            paid.user_id,
            paid.payment_month,
            paid.payment_amount,
            paid.payment_time.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

#[async_trait]
impl IdempotentHandler for PaymentNotifier {
    fn consumer_name(&self) -> &str {
        PAYMENT_NOTIFIER
    }

    fn event_type(&self) -> EventType {
        EventType::FeePaid
    }

    fn side_effect(&self, event: &DomainEvent) -> Result<SideEffect, HandlerError> {
        let paid = event
            .as_fee_paid()
            .ok_or_else(|| HandlerError::Permanent(format!("expected FeePaid, got {}", event.event_type())))?;

        Ok(SideEffect::RecordNotification(FeeNotification {
            fee_id: paid.fee_id,
            user_id: paid.user_id,
            message: Self::render(paid),
            created_at: event.emitted_at,
        }))
    }

    async fn on_applied(&self, event: &DomainEvent, _outcome: &ApplyOutcome) {
        if let Some(paid) = event.as_fee_paid() {
            tracing::info!(
                event_id = %event.event_id,
                fee_id = %paid.fee_id,
                user_id = %paid.user_id,
                "Payment notice recorded"
            );
        }
    }
}
