//! Core trait defining the verification and settlement interface for x402 facilitators.
//!
//! Implementors validate an encoded payment payload ([`Facilitator::verify`]) and
//! move the funds it authorizes ([`Facilitator::settle`]). The local engine and the
//! remote HTTP client both implement it, so a resource server does not care which
//! one it talks to.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::proto::{SettleReceipt, VerifiedPayment};

pub trait Facilitator {
    /// The error type returned by this facilitator.
    type Error: Debug + Display;

    /// Decodes, validates and authenticates the base64 `X-PAYMENT` value.
    ///
    /// Does not touch the rail and does not consume the payment.
    fn verify(
        &self,
        payment: &str,
    ) -> impl Future<Output = Result<VerifiedPayment, Self::Error>> + Send;

    /// Re-verifies the payment and settles it, at most once per `paymentId`.
    fn settle(
        &self,
        payment: &str,
    ) -> impl Future<Output = Result<SettleReceipt, Self::Error>> + Send;
}

impl<T: Facilitator> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        payment: &str,
    ) -> impl Future<Output = Result<VerifiedPayment, Self::Error>> + Send {
        self.as_ref().verify(payment)
    }

    fn settle(
        &self,
        payment: &str,
    ) -> impl Future<Output = Result<SettleReceipt, Self::Error>> + Send {
        self.as_ref().settle(payment)
    }
}
