//! Session aggregate: an ordered, append-only list of messages per
//! `(channel_id, session_id)`.

use tracing::debug;

use crate::ingestion::{ConversationMessage, SessionDescriptor, StoredMessage};
use crate::store::{StoreError, UnitOfWork};

/// Creates the session on first use and appends `message` as its next
/// entry. Runs inside the caller's transaction; the session row stays
/// locked until that transaction ends, so concurrent appends to one
/// session get consecutive sequence numbers.
pub fn create_or_append(
    tx: &mut dyn UnitOfWork,
    session: &SessionDescriptor,
    message: &ConversationMessage,
) -> Result<StoredMessage, StoreError> {
    if message.channel_id != session.channel_id || message.session_id != session.session_id {
        return Err(StoreError::Corrupt(format!(
            "message for {}/{} appended to session {}/{}",
            message.channel_id, message.session_id, session.channel_id, session.session_id
        )));
    }

    let existing = tx.lock_session(session)?;
    let seq = existing + 1;
    tx.insert_message(message, seq)?;
    tx.touch_session(session, seq, message.timestamp)?;
    debug!(
        "appended message session={} channel={} seq={}",
        session.session_id, session.channel_id, seq
    );

    Ok(StoredMessage {
        message: message.clone(),
        seq,
    })
}
