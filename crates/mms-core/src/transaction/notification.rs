use super::retrieve::fetch_and_store;
use super::{log_failure, TransactionContext, TransactionKind, TransactionTarget};
use crate::config::TransactionSettings;
use crate::error::CoreError;
use crate::ids::MessageRef;
use crate::pdu::{
    GenericPdu, NotificationInd, NotifyRespInd, MMS_VERSION_1_3, STATUS_DEFERRED,
    STATUS_RETRIEVED,
};
use crate::state::TransactionState;
use crate::store::Folder;
use log::{debug, warn};

pub(crate) async fn run(
    target: &TransactionTarget,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> TransactionState {
    let (uri, ind) = match resolve(target, ctx).await {
        Ok(resolved) => resolved,
        Err(err) => {
            log_failure(TransactionKind::Notification, target, &err);
            return TransactionState::failed(target.message_ref());
        }
    };
    match exchange(uri, &ind, settings, ctx).await {
        Ok(state) => state,
        Err(err) => {
            log_failure(TransactionKind::Notification, &uri, &err);
            TransactionState::failed(Some(uri))
        }
    }
}

async fn resolve(
    target: &TransactionTarget,
    ctx: &TransactionContext,
) -> Result<(MessageRef, NotificationInd), CoreError> {
    match target {
        TransactionTarget::Stored(uri) => match ctx.store.load_pdu(uri).await? {
            GenericPdu::NotificationInd(ind) => Ok((*uri, ind)),
            other => Err(CoreError::Protocol(format!(
                "expected notification, found {:?}",
                other.message_type()
            ))),
        },
        TransactionTarget::Push(bytes) => match ctx.codec.parse(bytes)? {
            GenericPdu::NotificationInd(ind) => {
                let uri = ctx
                    .store
                    .persist_pdu(GenericPdu::NotificationInd(ind.clone()), Folder::Inbox)
                    .await?;
                debug!("stored pushed notification as {}", uri);
                Ok((uri, ind))
            }
            other => Err(CoreError::Protocol(format!(
                "invalid push data: {:?}",
                other.message_type()
            ))),
        },
    }
}

async fn exchange(
    uri: MessageRef,
    ind: &NotificationInd,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> Result<TransactionState, CoreError> {
    if !ctx.auto_retrieve {
        respond(ind, STATUS_DEFERRED, settings, ctx).await;
        return Ok(TransactionState::success(uri));
    }
    let fetched = fetch_and_store(uri, &ind.content_location, settings, ctx).await?;
    let state = TransactionState::success(fetched.stored);
    respond(ind, STATUS_RETRIEVED, settings, ctx).await;
    Ok(state)
}

async fn respond(
    ind: &NotificationInd,
    status: u8,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) {
    let resp = GenericPdu::NotifyRespInd(NotifyRespInd {
        version: MMS_VERSION_1_3,
        transaction_id: ind.transaction_id.clone(),
        status,
    });
    let sent = match ctx.codec.compose(&resp) {
        Ok(bytes) => ctx.transport.post(settings, bytes).await.map(|_| ()),
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        warn!("notify response for {} not sent: {}", ind.content_location, err);
    }
}
