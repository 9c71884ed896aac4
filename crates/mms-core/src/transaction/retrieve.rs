use super::{log_failure, TransactionContext, TransactionKind};
use crate::config::TransactionSettings;
use crate::error::CoreError;
use crate::ids::MessageRef;
use crate::pdu::{AcknowledgeInd, GenericPdu, RetrieveConf, MMS_VERSION_1_3};
use crate::state::TransactionState;
use crate::store::{DownloadState, Folder};
use log::{debug, error, warn};

/// Downloads the message announced by the notification at `uri`, stores it
/// in the inbox and acknowledges it to the relay.
pub(crate) async fn run(
    uri: MessageRef,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> TransactionState {
    let state = match ctx.store.content_location(&uri).await {
        Ok(location) => {
            debug!("content location for {}: {}", uri, location);
            match exchange(uri, &location, settings, ctx).await {
                Ok(state) => state,
                Err(err) => {
                    log_failure(TransactionKind::Retrieve, &uri, &err);
                    TransactionState::failed(Some(uri))
                }
            }
        }
        Err(err) => {
            warn!("cannot get content location from {}: {}", uri, err);
            TransactionState::failed(Some(uri))
        }
    };
    if !state.is_success() {
        error!("retrieval of {} failed", uri);
    }
    state
}

async fn exchange(
    uri: MessageRef,
    location: &str,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> Result<TransactionState, CoreError> {
    let fetched = fetch_and_store(uri, location, settings, ctx).await?;
    let state = TransactionState::success(fetched.stored);
    if let Err(err) = acknowledge(&fetched.conf, settings, ctx).await {
        warn!("acknowledge for {} not sent: {}", uri, err);
    }
    Ok(state)
}

pub(crate) struct Fetched {
    pub conf: RetrieveConf,
    pub stored: MessageRef,
}

/// GET, parse, dedup and persist a retrieve-confirmation, then drop the
/// notification row it satisfied.
pub(crate) async fn fetch_and_store(
    notification: MessageRef,
    location: &str,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> Result<Fetched, CoreError> {
    if let Err(err) = ctx
        .store
        .mark_download_state(&notification, DownloadState::Downloading)
        .await
    {
        debug!("cannot mark {} downloading: {}", notification, err);
    }

    let bytes = ctx.transport.get(settings, location).await?;
    let conf = match ctx.codec.parse(&bytes)? {
        GenericPdu::RetrieveConf(conf) => conf,
        other => {
            return Err(CoreError::Protocol(format!(
                "expected retrieve conf, got {:?}",
                other.message_type()
            )))
        }
    };

    let duplicate = match conf.message_id.as_deref() {
        Some(message_id) => ctx.store.retrieve_conf_exists(message_id).await?,
        None => None,
    };

    let stored = match duplicate {
        Some(existing) => {
            debug!(
                "{} already stored as {}, skipping duplicate delivery",
                conf.message_id.as_deref().unwrap_or_default(),
                existing
            );
            existing
        }
        None => {
            let stored = ctx
                .store
                .persist_pdu(GenericPdu::RetrieveConf(conf.clone()), Folder::Inbox)
                .await?;
            if let Err(err) = ctx.store.update_content_location(&stored, location).await {
                debug!("cannot record content location for {}: {}", stored, err);
            }
            stored
        }
    };

    if let Err(err) = ctx.store.delete(&notification).await {
        warn!("cannot delete notification {}: {}", notification, err);
    }

    Ok(Fetched { conf, stored })
}

async fn acknowledge(
    conf: &RetrieveConf,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> Result<(), CoreError> {
    // No transaction id means the relay does not want an acknowledgement.
    let Some(transaction_id) = conf.transaction_id.clone() else {
        return Ok(());
    };
    let ack = GenericPdu::AcknowledgeInd(AcknowledgeInd {
        version: MMS_VERSION_1_3,
        transaction_id,
    });
    let bytes = ctx.codec.compose(&ack)?;
    ctx.transport.post(settings, bytes).await?;
    Ok(())
}
