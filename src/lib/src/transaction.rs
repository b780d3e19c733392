//! Server-held TUF root transactions
//!
//! A [`Transaction`] value stands for an active transaction: `init` creates
//! one, and `apply` and `cancel` consume it. A failed `apply` hands the
//! transaction back inside [`ApplyFailure`] together with what the operator
//! may safely do next.

use crate::api::{FactoryApi, TxPut, TxState};
use crate::audit;
use crate::error::TufError;

use std::fmt;

/// An active transaction, identified by the server-assigned txid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    txid: String,
    correlation_id: String,
}

impl Transaction {
    /// Open a new transaction. Fails with `Conflict` if the Factory already has one.
    pub fn init(api: &dyn FactoryApi, message: &str) -> Result<Self, TufError> {
        if message.trim().is_empty() {
            return Err(TufError::InvalidArgument(
                "A change reason is required to open a transaction".to_string(),
            ));
        }
        let txid = api.tx_init(message)?;
        let tx = Self {
            txid,
            correlation_id: audit::new_correlation_id(),
        };
        log::info!("Started TUF root transaction {}", tx.txid);
        audit::log_transaction_init(&tx.correlation_id, &tx.txid, message);
        Ok(tx)
    }

    /// Continue a transaction started by an earlier command.
    pub fn resume(txid: impl Into<String>) -> Result<Self, TufError> {
        let txid = txid.into();
        if txid.trim().is_empty() {
            return Err(TufError::UsageError("Missing transaction id"));
        }
        Ok(Self {
            txid,
            correlation_id: audit::new_correlation_id(),
        })
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn state(&self, api: &dyn FactoryApi) -> Result<TxState, TufError> {
        api.tx_get(&self.txid)
    }

    /// Replace the staged state. The whole state is sent on every call.
    pub fn update(
        &self,
        api: &dyn FactoryApi,
        update: &TxPut,
        operation: &str,
    ) -> Result<(), TufError> {
        api.tx_put(&self.txid, update)?;
        audit::log_transaction_update(
            &self.correlation_id,
            &self.txid,
            operation,
            update.ci_root.signed.version,
            update.prod_root.is_some(),
        );
        Ok(())
    }

    /// Publish the staged roots and signatures.
    pub fn apply(self, api: &dyn FactoryApi) -> Result<(), ApplyFailure> {
        match api.tx_apply(&self.txid) {
            Ok(()) => {
                log::info!("Applied TUF root transaction {}", self.txid);
                audit::log_apply_success(&self.correlation_id, &self.txid);
                Ok(())
            }
            Err(error) => {
                let failure = ApplyFailure::new(self, error);
                audit::log_apply_failure(
                    &failure.tx.correlation_id,
                    &failure.tx.txid,
                    failure.is_fatal(),
                    failure.error.kind(),
                    &failure.error.to_string(),
                );
                Err(failure)
            }
        }
    }

    /// Discard the staged state. Nothing is published before `apply`.
    pub fn cancel(self, api: &dyn FactoryApi) -> Result<(), TufError> {
        api.tx_cancel(&self.txid)?;
        log::info!("Canceled TUF root transaction {}", self.txid);
        audit::log_transaction_cancel(&self.correlation_id, &self.txid);
        Ok(())
    }
}

/// How bad a failed `apply` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailureKind {
    /// The server rejected the change; the Factory is unchanged.
    NonFatal,
    /// The apply may have been partially committed.
    Fatal,
}

/// A failed `apply`, carrying the still active transaction.
#[derive(Debug)]
pub struct ApplyFailure {
    pub tx: Transaction,
    pub error: TufError,
    pub kind: ApplyFailureKind,
}

impl ApplyFailure {
    pub fn new(tx: Transaction, error: TufError) -> Self {
        let kind = if error.is_non_fatal_apply() {
            ApplyFailureKind::NonFatal
        } else {
            ApplyFailureKind::Fatal
        };
        Self { tx, error, kind }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ApplyFailureKind::Fatal
    }

    /// What the operator can safely do next.
    pub fn guidance(&self) -> String {
        match self.kind {
            ApplyFailureKind::NonFatal => format!(
                "The Factory was not changed and transaction {} is still active. \
                 Fix the problem (e.g. add the missing signatures) and run `apply` again, \
                 or discard the transaction with `cancel`.",
                self.tx.txid
            ),
            ApplyFailureKind::Fatal => format!(
                "The apply of transaction {} may have been partially committed. \
                 Run `apply` again until it succeeds. Do NOT cancel this transaction.",
                self.tx.txid
            ),
        }
    }
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.error, self.guidance())
    }
}

impl From<ApplyFailure> for TufError {
    fn from(failure: ApplyFailure) -> Self {
        failure.error
    }
}
