use super::{log_failure, TransactionContext, TransactionKind};
use crate::config::TransactionSettings;
use crate::error::CoreError;
use crate::ids::MessageRef;
use crate::pdu::{GenericPdu, RESPONSE_STATUS_OK};
use crate::state::TransactionState;
use crate::store::Folder;
use log::{debug, warn};

/// Posts the send request stored at `uri` and files it under Sent once the
/// relay accepts it.
pub(crate) async fn run(
    uri: MessageRef,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> TransactionState {
    match exchange(uri, settings, ctx).await {
        Ok(state) => state,
        Err(err) => {
            log_failure(TransactionKind::Send, &uri, &err);
            TransactionState::failed(Some(uri))
        }
    }
}

async fn exchange(
    uri: MessageRef,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> Result<TransactionState, CoreError> {
    let req = match ctx.store.load_pdu(&uri).await? {
        GenericPdu::SendReq(req) => req,
        other => {
            return Err(CoreError::Protocol(format!(
                "expected send request, found {:?}",
                other.message_type()
            )))
        }
    };
    let bytes = ctx.codec.compose(&GenericPdu::SendReq(req.clone()))?;
    let response = ctx.transport.post(settings, bytes).await?;
    let conf = match ctx.codec.parse(&response)? {
        GenericPdu::SendConf(conf) => conf,
        other => {
            return Err(CoreError::Protocol(format!(
                "expected send conf, got {:?}",
                other.message_type()
            )))
        }
    };
    if conf.transaction_id != req.transaction_id {
        return Err(CoreError::Protocol("inconsistent transaction id".to_string()));
    }
    if conf.response_status != RESPONSE_STATUS_OK {
        warn!(
            "send {} rejected with status {:#04x}",
            uri, conf.response_status
        );
        return Ok(TransactionState::failed(Some(uri)));
    }
    if let Some(message_id) = conf.message_id.as_deref() {
        ctx.store.update_message_id(&uri, message_id).await?;
    }
    ctx.store.move_to_folder(&uri, Folder::Sent).await?;
    debug!("send {} accepted", uri);
    Ok(TransactionState::success(uri))
}
