//! Payment gateway port.
//!
//! The gateway is an external collaborator with at-least-once semantics, so
//! every call is keyed by booking id and safe to repeat: charging a booking
//! twice returns the first charge, refunding twice returns the first refund.
//!
//! [`MockPaymentGateway`] is the in-process adapter used by the dev server and
//! the tests. Its behaviour per charge can be scripted.

use crate::error::GatewayError;
use crate::types::{BookingId, Money};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

/// Boxed future returned by gateway operations.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Answer to a charge request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeOutcome {
    /// Money captured
    Approved {
        /// Gateway transaction id
        transaction_id: String,
    },
    /// The card was declined
    Declined {
        /// Gateway reason
        reason: String,
    },
}

/// Authoritative charge state as queried after the fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeStatus {
    /// Captured
    Approved {
        /// Gateway transaction id
        transaction_id: String,
    },
    /// Declined
    Declined {
        /// Gateway reason
        reason: String,
    },
    /// The gateway never saw a charge for this booking
    NotFound,
    /// The gateway cannot tell yet
    Unknown,
}

/// Proof of a refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    /// Gateway refund id
    pub refund_id: String,
    /// Amount actually refunded; zero when nothing was captured
    pub amount: Money,
}

/// Outbound payment operations.
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount` for a booking.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transient`] is safe to retry; [`GatewayError::Timeout`]
    /// leaves the outcome unknown.
    fn charge(&self, booking_id: BookingId, amount: Money) -> GatewayFuture<'_, ChargeOutcome>;

    /// Refund up to `amount` of a booking's charge.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transient`] is safe to retry.
    fn refund(&self, booking_id: BookingId, amount: Money) -> GatewayFuture<'_, RefundReceipt>;

    /// Look up what happened to a booking's charge.
    ///
    /// # Errors
    ///
    /// Transport failures only.
    fn charge_status(&self, booking_id: BookingId) -> GatewayFuture<'_, ChargeStatus>;
}

/// Scripted behaviour for one charge call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChargeScript {
    /// Capture and approve
    Approve,
    /// Decline with a reason
    Decline(String),
    /// Fail with a transient error, nothing captured
    Transient,
    /// Reject the request outright, nothing captured
    Reject(String),
    /// Time out, nothing captured
    Timeout,
    /// Capture, then time out before answering
    CaptureThenTimeout,
    /// Capture, then fail without a decision
    CaptureThenReject(String),
    /// Never answer
    Hang,
}

#[derive(Clone, Debug)]
struct ChargeRecord {
    amount: Money,
    status: ChargeStatus,
}

#[derive(Debug, Default)]
struct Ledger {
    script: VecDeque<ChargeScript>,
    charges: HashMap<BookingId, ChargeRecord>,
    refunds: HashMap<BookingId, RefundReceipt>,
    charge_calls: u32,
    refund_failures: u32,
    status_unknown: bool,
    next_id: u64,
}

impl Ledger {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:08}", self.next_id)
    }
}

/// In-process payment gateway.
///
/// Approves every charge unless scripted otherwise.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    ledger: Mutex<Ledger>,
}

impl MockPaymentGateway {
    /// A gateway that approves everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviours for the next charge calls, in order.
    pub fn script(&self, steps: impl IntoIterator<Item = ChargeScript>) {
        self.with_ledger(|l| l.script.extend(steps));
    }

    /// Make the next `count` refund calls fail transiently.
    pub fn fail_refunds(&self, count: u32) {
        self.with_ledger(|l| l.refund_failures = count);
    }

    /// Make `charge_status` answer [`ChargeStatus::Unknown`].
    pub fn set_status_unknown(&self, unknown: bool) {
        self.with_ledger(|l| l.status_unknown = unknown);
    }

    /// Number of charge calls received.
    #[must_use]
    pub fn charge_calls(&self) -> u32 {
        self.with_ledger(|l| l.charge_calls)
    }

    /// Amount captured for a booking, if any.
    #[must_use]
    pub fn captured(&self, booking_id: BookingId) -> Option<Money> {
        self.with_ledger(|l| {
            l.charges.get(&booking_id).and_then(|c| match c.status {
                ChargeStatus::Approved { .. } => Some(c.amount),
                _ => None,
            })
        })
    }

    /// Refund issued for a booking, if any.
    #[must_use]
    pub fn refunded(&self, booking_id: BookingId) -> Option<Money> {
        self.with_ledger(|l| l.refunds.get(&booking_id).map(|r| r.amount))
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> T {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut ledger)
    }

    fn capture(ledger: &mut Ledger, booking_id: BookingId, amount: Money) -> String {
        let transaction_id = ledger.next_id("txn");
        ledger.charges.insert(
            booking_id,
            ChargeRecord {
                amount,
                status: ChargeStatus::Approved {
                    transaction_id: transaction_id.clone(),
                },
            },
        );
        transaction_id
    }
}

enum ChargeStep {
    Done(Result<ChargeOutcome, GatewayError>),
    Hang,
}

impl PaymentGateway for MockPaymentGateway {
    fn charge(&self, booking_id: BookingId, amount: Money) -> GatewayFuture<'_, ChargeOutcome> {
        Box::pin(async move {
            let step = self.with_ledger(|l| {
                l.charge_calls += 1;

                if let Some(ChargeRecord {
                    status: ChargeStatus::Approved { transaction_id },
                    ..
                }) = l.charges.get(&booking_id)
                {
                    return ChargeStep::Done(Ok(ChargeOutcome::Approved {
                        transaction_id: transaction_id.clone(),
                    }));
                }

                match l.script.pop_front().unwrap_or(ChargeScript::Approve) {
                    ChargeScript::Approve => {
                        let transaction_id = Self::capture(l, booking_id, amount);
                        ChargeStep::Done(Ok(ChargeOutcome::Approved { transaction_id }))
                    },
                    ChargeScript::Decline(reason) => {
                        l.charges.insert(
                            booking_id,
                            ChargeRecord {
                                amount,
                                status: ChargeStatus::Declined {
                                    reason: reason.clone(),
                                },
                            },
                        );
                        ChargeStep::Done(Ok(ChargeOutcome::Declined { reason }))
                    },
                    ChargeScript::Transient => ChargeStep::Done(Err(GatewayError::Transient(
                        "gateway returned 503".to_string(),
                    ))),
                    ChargeScript::Reject(reason) => ChargeStep::Done(Err(GatewayError::Rejected(reason))),
                    ChargeScript::Timeout => ChargeStep::Done(Err(GatewayError::Timeout)),
                    ChargeScript::CaptureThenTimeout => {
                        Self::capture(l, booking_id, amount);
                        ChargeStep::Done(Err(GatewayError::Timeout))
                    },
                    ChargeScript::CaptureThenReject(reason) => {
                        Self::capture(l, booking_id, amount);
                        ChargeStep::Done(Err(GatewayError::Rejected(reason)))
                    },
                    ChargeScript::Hang => ChargeStep::Hang,
                }
            });

            match step {
                ChargeStep::Done(result) => result,
                ChargeStep::Hang => futures::future::pending().await,
            }
        })
    }

    fn refund(&self, booking_id: BookingId, amount: Money) -> GatewayFuture<'_, RefundReceipt> {
        Box::pin(async move {
            self.with_ledger(|l| {
                if l.refund_failures > 0 {
                    l.refund_failures -= 1;
                    return Err(GatewayError::Transient("refund endpoint unavailable".to_string()));
                }
                if let Some(receipt) = l.refunds.get(&booking_id) {
                    return Ok(receipt.clone());
                }
                let captured = match l.charges.get(&booking_id) {
                    Some(ChargeRecord {
                        amount: charged,
                        status: ChargeStatus::Approved { .. },
                    }) => *charged,
                    _ => Money::ZERO,
                };
                let receipt = RefundReceipt {
                    refund_id: l.next_id("rfnd"),
                    amount: amount.min(captured),
                };
                l.refunds.insert(booking_id, receipt.clone());
                Ok(receipt)
            })
        })
    }

    fn charge_status(&self, booking_id: BookingId) -> GatewayFuture<'_, ChargeStatus> {
        Box::pin(async move {
            Ok(self.with_ledger(|l| {
                if l.status_unknown {
                    return ChargeStatus::Unknown;
                }
                l.charges
                    .get(&booking_id)
                    .map_or(ChargeStatus::NotFound, |c| c.status.clone())
            }))
        })
    }
}
