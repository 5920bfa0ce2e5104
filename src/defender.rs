//! Answers a data-availability challenge against a committed bundle by
//! proving on L1 that a datum is part of the blob the bundle points to.

use std::sync::Arc;

use ethers::types::H256;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::RetryConfig;
use crate::da::{element_root, DaClient, DaProof};
use crate::error::{Error, Result};
use crate::l1::L1Chain;
use crate::l2::L2Chain;
use crate::retry::retry_with_backoff;
use crate::types::{
    BlockRef, CanonicalHeader, DatumKind, DefenseAux, ElementIndex, HeaderRef, SubmissionStatus,
    TxHandle,
};

#[derive(Debug, Clone, Default)]
pub struct DefenderOpts {
    /// Build and verify the proof but never send a transaction.
    pub dry_run: bool,
}

/// Result of one defense.
#[derive(Debug, Clone, Serialize)]
pub struct DefenseOutcome {
    pub bundle_hash: H256,
    pub datum: H256,
    pub element: ElementIndex,
    pub proof: DaProof,
    /// Unset on a dry run.
    pub tx: Option<TxHandle>,
    /// Set when the submission timed out and its status had to be looked up.
    pub status: Option<SubmissionStatus>,
}

pub struct Defender {
    l1: Arc<dyn L1Chain>,
    l2: Arc<dyn L2Chain>,
    da: Arc<dyn DaClient>,
    retry: RetryConfig,
    opts: DefenderOpts,
}

impl Defender {
    pub fn new(
        l1: Arc<dyn L1Chain>,
        l2: Arc<dyn L2Chain>,
        da: Arc<dyn DaClient>,
        retry: RetryConfig,
        opts: DefenderOpts,
    ) -> Self {
        Self {
            l1,
            l2,
            da,
            retry,
            opts,
        }
    }

    /// Proves that `datum` is in the bundle committed as `bundle_hash` and
    /// submits the proof.
    ///
    /// Reads are retried and cancellable. The submission itself is attempted
    /// exactly once; if its outcome cannot be observed the transaction is
    /// looked up by hash instead of being sent again.
    pub async fn defend(
        &self,
        bundle_hash: H256,
        datum: H256,
        kind: DatumKind,
        cancel_token: &CancellationToken,
    ) -> Result<DefenseOutcome> {
        tracing::info!(bundle = ?bundle_hash, datum = ?datum, kind = ?kind, "Defending datum");

        let header = retry_with_backoff("l1.header", &self.retry, cancel_token, || {
            self.l1.get_committed_header(HeaderRef::Hash(bundle_hash))
        })
        .await
        .into_result()?;

        let blob = retry_with_backoff("da.fetch", &self.retry, cancel_token, || {
            self.da.fetch(&header.da_pointer)
        })
        .await
        .into_result()?;

        let elements = bundle_contents(&header, &blob)?;
        let element = locate_datum(&elements, datum, kind).ok_or(Error::DatumNotInBundle {
            datum,
            bundle: bundle_hash,
        })?;
        tracing::debug!(bundle = ?bundle_hash, element = ?element, "Datum located");

        let proof = retry_with_backoff("da.proof", &self.retry, cancel_token, || {
            self.da.get_inclusion_proof(&header.da_pointer, element)
        })
        .await
        .into_result()?;
        // The proof must be about the blob we fetched, not just any blob
        // that happens to contain the datum.
        proof.verify(&header.da_pointer, element_root(&elements))?;
        if proof.element != element || proof.leaf != datum {
            return Err(Error::InvalidProof(format!(
                "proof is for {:?} with leaf {:?}, expected {element:?} with {datum:?}",
                proof.element, proof.leaf
            )));
        }

        let mut outcome = DefenseOutcome {
            bundle_hash,
            datum,
            element,
            proof,
            tx: None,
            status: None,
        };

        if self.opts.dry_run {
            tracing::info!(bundle = ?bundle_hash, "Dry run, proof not submitted");
            return Ok(outcome);
        }
        if cancel_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let aux = DefenseAux { datum, element };
        match self.l1.submit_defense(bundle_hash, &outcome.proof, aux).await {
            Ok(tx) => {
                tracing::info!(bundle = ?bundle_hash, tx = ?tx.tx_hash, "Defense confirmed");
                outcome.tx = Some(tx);
                Ok(outcome)
            }
            Err(Error::Timeout { tx_hash }) => {
                tracing::warn!(tx = ?tx_hash, "Defense outcome unknown, querying status");
                let status = self.l1.submission_status(tx_hash).await;
                match status {
                    Ok(SubmissionStatus::Included { success: false, .. }) => Err(
                        Error::SubmissionFailed(format!("defense transaction {tx_hash:?} reverted")),
                    ),
                    Ok(status @ (SubmissionStatus::Pending | SubmissionStatus::Included { .. })) => {
                        outcome.tx = Some(TxHandle { tx_hash });
                        outcome.status = Some(status);
                        Ok(outcome)
                    }
                    Ok(SubmissionStatus::Unknown) => Err(Error::Timeout { tx_hash }),
                    Err(e) => {
                        tracing::warn!(tx = ?tx_hash, error = %e, "Status query failed");
                        Err(Error::Timeout { tx_hash })
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Canonical hash of L2 block `number`, the datum that proves its header.
    pub async fn resolve_block_datum(
        &self,
        number: u64,
        cancel_token: &CancellationToken,
    ) -> Result<H256> {
        let block = retry_with_backoff("l2.block", &self.retry, cancel_token, || {
            self.l2.get_block(BlockRef::Number(number))
        })
        .await
        .into_result()?;
        Ok(block.header.canonical_hash())
    }
}

/// Elements of `blob`, which must hold exactly the blocks `header` covers.
pub fn bundle_contents(
    header: &CanonicalHeader,
    blob: &[u8],
) -> Result<Vec<(ElementIndex, H256)>> {
    let blocks = codec::decode_bundle_blob(blob)?;

    let numbers: Vec<u64> = blocks.iter().map(|b| b.number()).collect();
    let expected: Vec<u64> = (header.block_range_start..=header.block_range_end).collect();
    if numbers != expected {
        return Err(Error::MalformedBlob(format!(
            "blob holds blocks {numbers:?}, header covers {}-{}",
            header.block_range_start, header.block_range_end
        )));
    }

    Ok(codec::bundle_elements(&blocks))
}

/// First element of kind `kind` whose leaf is `datum`.
pub fn locate_datum(
    elements: &[(ElementIndex, H256)],
    datum: H256,
    kind: DatumKind,
) -> Option<ElementIndex> {
    elements
        .iter()
        .find(|(element, leaf)| *leaf == datum && kind.accepts(element))
        .map(|(element, _)| *element)
}
