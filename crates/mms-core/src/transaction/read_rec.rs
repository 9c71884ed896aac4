use super::{log_failure, TransactionContext, TransactionKind};
use crate::config::TransactionSettings;
use crate::error::CoreError;
use crate::ids::MessageRef;
use crate::pdu::GenericPdu;
use crate::state::TransactionState;
use crate::store::Folder;

pub(crate) async fn run(
    uri: MessageRef,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> TransactionState {
    match exchange(uri, settings, ctx).await {
        Ok(()) => TransactionState::success(uri),
        Err(err) => {
            log_failure(TransactionKind::ReadRec, &uri, &err);
            TransactionState::failed(Some(uri))
        }
    }
}

async fn exchange(
    uri: MessageRef,
    settings: &TransactionSettings,
    ctx: &TransactionContext,
) -> Result<(), CoreError> {
    let pdu = ctx.store.load_pdu(&uri).await?;
    if !matches!(pdu, GenericPdu::ReadRecInd(_)) {
        return Err(CoreError::Protocol(format!(
            "expected read report, found {:?}",
            pdu.message_type()
        )));
    }
    let bytes = ctx.codec.compose(&pdu)?;
    ctx.transport.post(settings, bytes).await?;
    ctx.store.move_to_folder(&uri, Folder::Sent).await
}
