//! Offline walkthrough of one conversation against the in-memory backend.

use chat_sync::{
    logging, Backends, Conversation, ConversationSync, InMemoryBackend, ReadMarker, SignalBus,
    SyncConfig, SyncEvent,
};
use chrono::Utc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();
    let config = SyncConfig::from_env()?;

    let backend = InMemoryBackend::new();
    let me = Uuid::new_v4();
    let them = Uuid::new_v4();
    let conversation = Conversation {
        id: 1,
        participant_a: me,
        participant_b: them,
        last_message_at: None,
    };

    for i in 0..5 {
        backend.seed(
            conversation.id,
            them,
            &format!("earlier message {}", i),
            Utc::now() - chrono::Duration::minutes(10 - i),
        );
    }

    let signals = SignalBus::new();
    let (_, mut events) = signals.subscribe();
    let listener = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::MessagesChanged { tail_changed, .. } => {
                    info!(tail_changed, "messages changed")
                }
                SyncEvent::SendFailed { client_key, reason, .. } => {
                    info!(client_key = %client_key, reason = %reason, "send failed")
                }
                SyncEvent::SeenUpdated { seen_through, .. } => {
                    info!(seen_through = %seen_through, "seen")
                }
                SyncEvent::HistoryExhausted { .. } => info!("history exhausted"),
            }
        }
    });

    let sync = ConversationSync::new(
        conversation.clone(),
        me,
        Backends::shared(backend.clone()),
        &config,
        signals,
    )?;
    sync.activate().await?;
    sync.set_at_bottom(true);

    sync.send("hey, are you around?").await?;
    backend.deliver_message(conversation.id, them, "yes! one sec");
    backend.deliver_read_marker(ReadMarker {
        conversation_id: conversation.id,
        user_id: them,
        last_read_at: Utc::now(),
    });

    // Lost on the realtime feed; the poller picks it up.
    backend.mute_realtime(true);
    backend.deliver_message(conversation.id, them, "did you get this?");
    tokio::time::sleep(config.poll_interval + config.poll_interval / 2).await;
    backend.mute_realtime(false);

    while sync.has_more_history() {
        sync.load_older().await?;
    }

    for entry in sync.timeline() {
        info!(
            identity = %entry.message.identity,
            delivery = ?entry.delivery,
            content = %entry.message.content,
            "timeline"
        );
    }

    sync.deactivate().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(sync);
    listener.abort();
    Ok(())
}
