//! Outbound dispatch: length guard, split, pacing, send.

use crate::context::MsgContext;
use crate::format::SPLIT_SENTINEL;
use dicebot_ipc::{Message, OutboundTarget};
use tracing::{info, warn};

pub const MAX_OUTBOUND_CHARS: usize = 15000;
pub const TEXT_TOO_LONG: &str = "要发送的文本过长";

/// Oversized text is replaced wholesale, never truncated.
fn prepare_outbound(text: &str) -> String {
    if text.chars().count() > MAX_OUTBOUND_CHARS {
        return TEXT_TOO_LONG.to_string();
    }
    text.trim().to_string()
}

/// Ordered, trimmed segments between split sentinels. Empty segments are
/// kept, so every sentinel yields one more send.
pub fn split_segments(text: &str) -> Vec<&str> {
    text.split(SPLIT_SENTINEL).map(str::trim).collect()
}

async fn send_segments(
    ctx: &MsgContext,
    target: OutboundTarget,
    recipient: &str,
    text: &str,
    flag: &str,
) {
    let transport = &ctx.endpoint.transport;
    let timeout = ctx.dice.pacing.send_timeout();

    for segment in split_segments(text) {
        if let Some(delay) = ctx.dice.pacing.delay_for(&ctx.endpoint.platform) {
            tokio::time::sleep(delay).await;
        }

        let send = match target {
            OutboundTarget::Group => transport.send_to_group(recipient, segment, flag),
            OutboundTarget::Person => transport.send_to_person(recipient, segment, flag),
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Send to {:?} {} failed: {}", target, recipient, e),
            Err(_) => warn!(
                "Send to {:?} {} timed out after {:?}",
                target, recipient, timeout
            ),
        }
    }
}

pub async fn reply_group_raw(ctx: &MsgContext, msg: &Message, text: &str, flag: &str) {
    let text = prepare_outbound(text);
    info!("Send to group {}: {}", msg.group_id, text);
    send_segments(ctx, OutboundTarget::Group, &msg.group_id, &text, flag).await;
}

pub async fn reply_group(ctx: &MsgContext, msg: &Message, text: &str) {
    reply_group_raw(ctx, msg, text, "").await;
}

pub async fn reply_person_raw(ctx: &MsgContext, msg: &Message, text: &str, flag: &str) {
    let text = prepare_outbound(text);
    info!("Send to user {}: {}", msg.sender.user_id, text);
    send_segments(ctx, OutboundTarget::Person, &msg.sender.user_id, &text, flag).await;
}

pub async fn reply_person(ctx: &MsgContext, msg: &Message, text: &str) {
    reply_person_raw(ctx, msg, text, "").await;
}

/// Route to the group for group messages, to the sender otherwise.
pub async fn reply_to_sender_raw(ctx: &MsgContext, msg: &Message, text: &str, flag: &str) {
    if msg.is_group() {
        reply_group_raw(ctx, msg, text, flag).await;
    } else {
        reply_person_raw(ctx, msg, text, flag).await;
    }
}

pub async fn reply_to_sender(ctx: &MsgContext, msg: &Message, text: &str) {
    reply_to_sender_raw(ctx, msg, text, "").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{normalize_split, render_text};
    use crate::testing::{test_context, test_context_with_pacing, RecordingTransport, Sent};
    use dicebot_policy::PacingPolicy;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn oversized_text_is_replaced_with_notice() {
        let transport = RecordingTransport::new();
        let ctx = test_context(transport.clone(), "QQ");
        let msg = Message::group("1001", "42", "alice", "");
        let text = format!("{}{}", "x".repeat(MAX_OUTBOUND_CHARS), SPLIT_SENTINEL);
        assert_eq!(text.chars().count(), MAX_OUTBOUND_CHARS + SPLIT_SENTINEL.len());

        reply_to_sender(&ctx, &msg, &"y".repeat(MAX_OUTBOUND_CHARS + 1)).await;
        reply_to_sender(&ctx, &msg, &text).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.text == TEXT_TOO_LONG));
    }

    #[tokio::test]
    async fn text_at_ceiling_is_sent() {
        let transport = RecordingTransport::new();
        let ctx = test_context(transport.clone(), "QQ");
        let msg = Message::private("42", "alice", "");
        let text = "字".repeat(MAX_OUTBOUND_CHARS);
        reply_to_sender(&ctx, &msg, &text).await;
        assert_eq!(transport.sent()[0].text, text);
    }

    #[tokio::test]
    async fn two_aliases_split_into_three_ordered_sends() {
        let transport = RecordingTransport::new();
        let ctx = test_context(transport.clone(), "QQ");
        let msg = Message::group("1001", "42", "alice", "");
        let text = render_text(&ctx, "first #{SPLIT} second {FormFeed} third");
        reply_to_sender_raw(&ctx, &msg, &text, "flag-1").await;

        assert_eq!(
            transport.sent(),
            vec![
                Sent::group("1001", "first", "flag-1"),
                Sent::group("1001", "second", "flag-1"),
                Sent::group("1001", "third", "flag-1"),
            ]
        );
    }

    #[tokio::test]
    async fn private_replies_go_to_sender() {
        let transport = RecordingTransport::new();
        let ctx = test_context(transport.clone(), "QQ");
        let msg = Message::private("42", "alice", "");
        reply_to_sender(&ctx, &msg, "  hi  ").await;
        assert_eq!(transport.sent(), vec![Sent::person("42", "hi", "")]);
    }

    #[test]
    fn split_segments_trims_and_keeps_empty() {
        let text = normalize_split(" a #{SPLIT}#{SPLIT} b ");
        assert_eq!(split_segments(&text), vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn every_split_part_is_sent() {
        let transport = RecordingTransport::new();
        let ctx = test_context(transport.clone(), "QQ");
        let msg = Message::group("1001", "42", "alice", "");
        reply_group(&ctx, &msg, "a###SPLIT######SPLIT###b###SPLIT###").await;
        let texts: Vec<String> = transport.sent().into_iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["a", "", "b", ""]);
    }

    #[tokio::test]
    async fn send_failures_do_not_stop_remaining_segments() {
        let transport = RecordingTransport::failing_on("boom");
        let ctx = test_context(transport.clone(), "QQ");
        let msg = Message::group("1001", "42", "alice", "");
        reply_group(&ctx, &msg, "ok1###SPLIT###boom###SPLIT###ok2").await;
        let texts: Vec<String> = transport.sent().into_iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["ok1", "ok2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out_and_continues() {
        let transport = RecordingTransport::hanging_on("slow");
        let pacing = PacingPolicy::disabled().with_send_timeout(Duration::from_secs(2));
        let ctx = test_context_with_pacing(transport.clone(), "QQ", pacing);
        let msg = Message::private("42", "alice", "");
        reply_person(&ctx, &msg, "slow###SPLIT###fast").await;
        let texts: Vec<String> = transport.sent().into_iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_platform_waits_before_each_send() {
        let transport = RecordingTransport::new();
        let pacing = PacingPolicy::new(Some(&dicebot_config::PacingConfig {
            platforms: vec!["QQ".to_string()],
            delay_min_secs: 1.0,
            delay_max_secs: 1.0,
            send_timeout_secs: 30,
        }));
        let ctx = test_context_with_pacing(transport.clone(), "QQ", pacing);
        let msg = Message::private("42", "alice", "");

        let start = tokio::time::Instant::now();
        reply_person(&ctx, &msg, "a###SPLIT###b###SPLIT###c").await;
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn unpaced_platform_does_not_wait() {
        let transport = RecordingTransport::new();
        let ctx = test_context(transport.clone(), "Discord");
        let msg = Message::private("42", "alice", "");
        let start = Instant::now();
        reply_person(&ctx, &msg, "a###SPLIT###b").await;
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(transport.sent().len(), 2);
    }
}
