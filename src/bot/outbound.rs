use crate::constants::{RETRY_AFTER_ABORT_SECS, SEND_RETRY_BASE_MS, SEND_RETRY_MAX_ATTEMPTS};
use std::path::PathBuf;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, ReplyMarkup};
use teloxide::RequestError;

/// Result of one outbound delivery after the retry policy ran its course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The user blocked the bot or deactivated their account.
    Blocked,
    Failed,
}

enum ErrClass {
    /// Harmless edit noise ("message is not modified", "query is too old").
    Benign,
    Blocked,
    RetryAfter(u64),
    Transient,
    Permanent,
}

/// The Telegram API reports most of these conditions only in error text, so
/// classification matches on the rendered message.
fn classify(err: &RequestError) -> ErrClass {
    if let RequestError::RetryAfter(secs) = err {
        return ErrClass::RetryAfter(secs.seconds() as u64);
    }
    if matches!(err, RequestError::Network(_) | RequestError::Io(_)) {
        return ErrClass::Transient;
    }

    let text = err.to_string().to_ascii_lowercase();
    if text.contains("message is not modified") || text.contains("query is too old") {
        return ErrClass::Benign;
    }
    if text.contains("bot was blocked") || text.contains("user is deactivated") {
        return ErrClass::Blocked;
    }
    if text.contains("timed out") || text.contains("gateway") {
        return ErrClass::Transient;
    }
    ErrClass::Permanent
}

async fn run_with_retry<F, Fut>(what: &str, chat_id: i64, mut send: F) -> SendOutcome
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<(), RequestError>>,
{
    for attempt in 0..SEND_RETRY_MAX_ATTEMPTS {
        match send().await {
            Ok(()) => return SendOutcome::Sent,
            Err(err) => match classify(&err) {
                ErrClass::Benign => return SendOutcome::Sent,
                ErrClass::Blocked => {
                    tracing::info!("Chat {} blocked the bot during {}", chat_id, what);
                    return SendOutcome::Blocked;
                }
                ErrClass::RetryAfter(advised) => {
                    if advised > RETRY_AFTER_ABORT_SECS {
                        tracing::warn!(
                            "Rate limit of {}s too long for {} to chat {}; aborting",
                            advised,
                            what,
                            chat_id
                        );
                        return SendOutcome::Failed;
                    }
                    tokio::time::sleep(Duration::from_secs(advised + 1)).await;
                }
                ErrClass::Transient => {
                    let delay = Duration::from_millis(SEND_RETRY_BASE_MS * 2u64.pow(attempt));
                    tracing::debug!(
                        "Transient telegram error during {} to chat {} (attempt {}): {}",
                        what,
                        chat_id,
                        attempt + 1,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                ErrClass::Permanent => {
                    tracing::warn!("Telegram {} to chat {} failed: {}", what, chat_id, err);
                    return SendOutcome::Failed;
                }
            },
        }
    }
    SendOutcome::Failed
}

pub async fn send_text(bot: &Bot, chat_id: i64, text: &str) -> SendOutcome {
    run_with_retry("send", chat_id, || async move {
        bot.send_message(ChatId(chat_id), text).await.map(|_| ())
    })
    .await
}

pub async fn send_text_with_markup(
    bot: &Bot,
    chat_id: i64,
    text: &str,
    markup: ReplyMarkup,
) -> SendOutcome {
    let markup = &markup;
    run_with_retry("send", chat_id, || async move {
        bot.send_message(ChatId(chat_id), text)
            .reply_markup(markup.clone())
            .await
            .map(|_| ())
    })
    .await
}

/// Edit in place when we know the message, falling back to a fresh send.
/// Benign edit failures count as success.
pub async fn edit_or_send(
    bot: &Bot,
    chat_id: i64,
    message_id: Option<MessageId>,
    text: &str,
    markup: Option<ReplyMarkup>,
) -> SendOutcome {
    if let Some(message_id) = message_id {
        let result = match markup.clone() {
            Some(ReplyMarkup::InlineKeyboard(keyboard)) => {
                bot.edit_message_text(ChatId(chat_id), message_id, text)
                    .reply_markup(keyboard)
                    .await
                    .map(|_| ())
            }
            _ => bot
                .edit_message_text(ChatId(chat_id), message_id, text)
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => return SendOutcome::Sent,
            Err(err) => match classify(&err) {
                ErrClass::Benign => return SendOutcome::Sent,
                ErrClass::Blocked => return SendOutcome::Blocked,
                _ => {
                    tracing::debug!("Edit failed for chat {}; sending instead: {}", chat_id, err)
                }
            },
        }
    }

    match markup {
        Some(markup) => send_text_with_markup(bot, chat_id, text, markup).await,
        None => send_text(bot, chat_id, text).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::ApiError;

    #[test]
    fn benign_edit_errors_count_as_success() {
        let not_modified = RequestError::Api(ApiError::Unknown(
            "Bad Request: message is not modified".to_string(),
        ));
        assert!(matches!(classify(&not_modified), ErrClass::Benign));

        let stale = RequestError::Api(ApiError::Unknown(
            "Bad Request: query is too old and response timeout expired".to_string(),
        ));
        assert!(matches!(classify(&stale), ErrClass::Benign));
    }

    #[test]
    fn blocked_users_are_detected() {
        let blocked = RequestError::Api(ApiError::BotBlocked);
        assert!(matches!(classify(&blocked), ErrClass::Blocked));

        let deactivated = RequestError::Api(ApiError::Unknown(
            "Forbidden: user is deactivated".to_string(),
        ));
        assert!(matches!(classify(&deactivated), ErrClass::Blocked));
    }

    #[test]
    fn unknown_api_errors_are_permanent() {
        let err = RequestError::Api(ApiError::Unknown("Bad Request: chat not found".to_string()));
        assert!(matches!(classify(&err), ErrClass::Permanent));
    }
}

/// Deliver one media file with an optional caption. `media_kind` is the
/// stored discriminator: photo, video, or animation.
pub async fn send_media(
    bot: &Bot,
    chat_id: i64,
    media_kind: &str,
    path: &str,
    caption: Option<&str>,
) -> SendOutcome {
    let file_path = PathBuf::from(path);
    run_with_retry("media send", chat_id, || {
        let input = InputFile::file(file_path.clone());
        let caption = caption.map(str::to_string);
        async move {
            match media_kind {
                "video" => {
                    let mut req = bot.send_video(ChatId(chat_id), input);
                    if let Some(caption) = caption {
                        req = req.caption(caption);
                    }
                    req.await.map(|_| ())
                }
                "animation" => {
                    let mut req = bot.send_animation(ChatId(chat_id), input);
                    if let Some(caption) = caption {
                        req = req.caption(caption);
                    }
                    req.await.map(|_| ())
                }
                _ => {
                    let mut req = bot.send_photo(ChatId(chat_id), input);
                    if let Some(caption) = caption {
                        req = req.caption(caption);
                    }
                    req.await.map(|_| ())
                }
            }
        }
    })
    .await
}
