//! End-to-end session scenarios over a mock transport: simple turns,
//! barge-in, tool calls, silence handling, exit intent, VAD and memory.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use serde_json::json;
use voxserve::config::Config;
use voxserve::dialogue::memory::{Memory, SqliteMemory, SqliteStore};
use voxserve::dialogue::{FunctionCall, ToolCall};
use voxserve::providers::LlmChunk;

fn tool_call_chunk(id: &str, name: &str, arguments: &str) -> LlmChunk {
    LlmChunk {
        tool_calls: vec![ToolCall {
            id: id.into(),
            r#type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            index: 0,
        }],
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// S1: simple turn
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn simple_turn_emits_full_event_sequence() {
    let session = start_session(SessionOptions {
        llm_responses: vec![vec![content_chunk("It's 3 "), content_chunk("o'clock.")]],
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    assert!(wait_for(|| session.asr.has_listener(), 1000).await);

    // 1 s of silence, then speech.
    for _ in 0..5 {
        session.conn.push_binary(vec![0u8; 640]).await;
    }
    session.conn.push_binary(vec![1u8; 640]).await;
    assert!(
        wait_for(
            || session.asr.audio_bytes.load(Ordering::Relaxed) >= 6 * 640,
            1000
        )
        .await,
        "audio should reach the recognizer"
    );

    // The recognizer finalizes the utterance; auto mode dispatches and
    // pauses recognition.
    assert!(session.asr.emit("what time is it", true));

    assert!(
        wait_for(
            || tts_states(&session.conn.sent_events()).contains(&"stop".to_string()),
            5000
        )
        .await,
        "round should complete with a tts stop event"
    );

    let events = session.conn.sent_events();
    assert_eq!(events[0]["type"], "hello");
    assert_eq!(events[0]["audio_params"]["format"], "pcm");

    let stt: Vec<&serde_json::Value> = events.iter().filter(|e| e["type"] == "stt").collect();
    assert_eq!(stt.len(), 1);
    assert_eq!(stt[0]["text"], "what time is it");

    assert_eq!(
        tts_states(&events),
        vec!["start", "sentence_start", "sentence_end", "stop"]
    );
    let sentence_start = events
        .iter()
        .find(|e| e["type"] == "tts" && e["state"] == "sentence_start")
        .unwrap();
    assert_eq!(sentence_start["text"], "It's 3 o'clock.");
    assert_eq!(sentence_start["index"], 1);

    assert!(!session.conn.sent_binary().is_empty(), "audio frames sent");

    // Binary audio sits strictly between sentence_start and sentence_end.
    let sequence = session.conn.sent_sequence();
    let start_pos = sequence
        .iter()
        .position(|f| matches!(f, SentFrame::Event(e) if e["state"] == "sentence_start"))
        .unwrap();
    let end_pos = sequence
        .iter()
        .position(|f| matches!(f, SentFrame::Event(e) if e["state"] == "sentence_end"))
        .unwrap();
    let audio_positions: Vec<usize> = sequence
        .iter()
        .enumerate()
        .filter(|(_, f)| matches!(f, SentFrame::Audio(_)))
        .map(|(i, _)| i)
        .collect();
    assert!(!audio_positions.is_empty());
    assert!(audio_positions.iter().all(|&p| p > start_pos && p < end_pos));

    session.handler.close().await;
    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// S2: barge-in
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn abort_stops_audio_and_new_round_starts_clean() {
    let long_reply: Vec<LlmChunk> = (1..=5)
        .map(|i| content_chunk(&format!("Sentence number {}.", i)))
        .collect();
    let session = start_session(SessionOptions {
        llm_responses: vec![long_reply, vec![content_chunk("Second round reply.")]],
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    session
        .conn
        .push_json(json!({"type": "chat", "text": "tell me a story"}))
        .await;

    assert!(
        wait_for(|| !session.conn.sent_binary().is_empty(), 5000).await,
        "first audio frame should arrive"
    );

    session.conn.push_json(json!({"type": "abort"})).await;
    assert!(
        wait_for(
            || tts_states(&session.conn.sent_events()).iter().any(|s| s == "stop"),
            2000
        )
        .await,
        "abort should produce a tts stop"
    );

    // Frame counts settle: at most the in-flight segment finishes.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let settled = session.conn.sent_binary().len();
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(
        session.conn.sent_binary().len(),
        settled,
        "no further audio after abort"
    );
    assert!(!session.handler.is_closed(), "abort keeps the session open");

    // A fresh utterance opens round 2 normally.
    let events_before = session.conn.sent_events().len();
    session
        .conn
        .push_json(json!({"type": "chat", "text": "never mind, go on"}))
        .await;
    assert!(
        wait_for(
            || {
                let events = session.conn.sent_events();
                events[events_before..]
                    .iter()
                    .any(|e| e["type"] == "tts" && e["state"] == "stop")
            },
            5000
        )
        .await,
        "second round should complete"
    );
    let events = session.conn.sent_events();
    let new_round = &events[events_before..];
    assert!(new_round.iter().any(|e| e["type"] == "stt"));
    assert!(new_round
        .iter()
        .any(|e| e["type"] == "tts" && e["state"] == "start"));

    session.handler.close().await;
    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// S3: tool call
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn tool_call_round_trips_through_dispatcher_and_memory() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut config = Config::default();
    config.dialog_storage = "sqlite".into();

    let session = start_session(SessionOptions {
        config,
        llm_responses: vec![
            vec![tool_call_chunk("call_1", "get_time", "{}")],
            vec![content_chunk("It is three o'clock.")],
        ],
        sqlite: Some(store.clone()),
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    session
        .conn
        .push_json(json!({"type": "chat", "text": "what time is it"}))
        .await;

    assert!(
        wait_for(
            || tts_states(&session.conn.sent_events()).iter().any(|s| s == "stop"),
            5000
        )
        .await
    );

    assert_eq!(session.llm.call_count(), 2, "tool result re-enters the LLM");

    // Second call sees the tool exchange.
    let second_call = session.llm.calls.lock().unwrap()[1].clone();
    let assistant_with_calls = second_call
        .iter()
        .find(|m| m.role == "assistant" && m.tool_calls.is_some())
        .expect("assistant(tool_calls) message present");
    assert_eq!(
        assistant_with_calls.tool_calls.as_ref().unwrap()[0]
            .function
            .name,
        "get_time"
    );
    let tool_message = second_call
        .iter()
        .find(|m| m.role == "tool")
        .expect("tool message present");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    assert!(tool_message.content.contains("current time"));

    // Persistence: user + final assistant only, never tool rows.
    let memory = SqliteMemory::new(store, "42");
    let rows = memory.query_messages_limit(0).await.unwrap();
    let roles: Vec<&str> = rows.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant"]);
    assert_eq!(rows[1].content, "It is three o'clock.");

    session.handler.close().await;
    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// S5: silence close
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn repeated_silence_winds_down_the_conversation() {
    let session = start_session(SessionOptions {
        llm_responses: vec![vec![content_chunk("Alright, talk to you later.")]],
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    assert!(wait_for(|| session.asr.has_listener(), 1000).await);

    session.asr.silence.store(2, Ordering::Relaxed);
    assert!(session.asr.emit("", true));

    assert!(
        wait_for(|| session.handler.is_closed(), 5000).await,
        "session should close after the goodbye finishes"
    );

    assert_eq!(session.llm.call_count(), 1);
    let call = session.llm.calls.lock().unwrap()[0].clone();
    let user_turn = call.iter().find(|m| m.role == "user").unwrap();
    assert_eq!(user_turn.content, "user silent, politely end conversation");

    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// S6: exit intent
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn exit_command_closes_without_model_or_speech() {
    let mut config = Config::default();
    config.cmd_exit = vec!["goodbye".into()];

    let session = start_session(SessionOptions {
        config,
        llm_responses: vec![vec![content_chunk("should never be spoken")]],
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    session
        .conn
        .push_json(json!({"type": "chat", "text": "goodbye."}))
        .await;

    assert!(wait_for(|| session.handler.is_closed(), 2000).await);
    assert_eq!(session.llm.call_count(), 0, "no model call on exit intent");
    assert_eq!(session.tts.synth_count(), 0, "no synthesis on exit intent");

    let events = session.conn.sent_events();
    assert!(
        events.iter().all(|e| e["type"] != "stt"),
        "exit happens before any round starts"
    );

    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// P1: segment ordering
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn segment_audio_is_transmitted_in_order_without_interleaving() {
    let session = start_session(SessionOptions {
        llm_responses: vec![vec![content_chunk("One."), content_chunk("Two.")]],
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    session
        .conn
        .push_json(json!({"type": "chat", "text": "count"}))
        .await;

    assert!(
        wait_for(
            || tts_states(&session.conn.sent_events()).iter().any(|s| s == "stop"),
            8000
        )
        .await
    );

    // Frames carry the synthesis ordinal in their samples; segment 1's
    // frames must all precede segment 2's.
    let fills: Vec<u8> = session
        .conn
        .sent_binary()
        .iter()
        .map(|frame| *frame.iter().find(|&&b| b != 0).unwrap_or(&0))
        .collect();
    assert!(fills.contains(&1) && fills.contains(&2));
    let last_of_first = fills.iter().rposition(|&f| f == 1).unwrap();
    let first_of_second = fills.iter().position(|&f| f == 2).unwrap();
    assert!(
        last_of_first < first_of_second,
        "segment 2 audio started before segment 1 finished: {:?}",
        fills
    );

    // Both sentence envelopes arrived, in order.
    let events = session.conn.sent_events();
    let indices: Vec<i64> = events
        .iter()
        .filter(|e| e["type"] == "tts" && e["state"] == "sentence_start")
        .map(|e| e["index"].as_i64().unwrap())
        .collect();
    assert_eq!(indices, vec![1, 2]);

    session.handler.close().await;
    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// P3: memory append-only, no system rows
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn memory_is_append_only_and_excludes_system_prompt() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut config = Config::default();
    config.dialog_storage = "sqlite".into();
    config.default_prompt = "you are a voice assistant".into();

    let session = start_session(SessionOptions {
        config,
        llm_responses: vec![
            vec![content_chunk("First answer.")],
            vec![content_chunk("Second answer.")],
        ],
        sqlite: Some(store.clone()),
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    for _ in 0..2 {
        let stops_before = tts_states(&session.conn.sent_events())
            .iter()
            .filter(|s| *s == "stop")
            .count();
        session
            .conn
            .push_json(json!({"type": "chat", "text": "same question"}))
            .await;
        assert!(
            wait_for(
                || {
                    tts_states(&session.conn.sent_events())
                        .iter()
                        .filter(|s| *s == "stop")
                        .count()
                        > stops_before
                },
                5000
            )
            .await
        );
    }

    let memory = SqliteMemory::new(store, "42");
    let rows = memory.query_messages_limit(0).await.unwrap();
    let user_rows = rows.iter().filter(|m| m.role == "user").count();
    assert_eq!(user_rows, 2, "identical messages stored twice (append-only)");
    assert!(rows.iter().all(|m| m.role != "system"));

    session.handler.close().await;
    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// P4: VAD rising edge
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn vad_rising_edge_flushes_buffered_frames_then_streams() {
    let session = start_session(SessionOptions {
        enable_vad: true,
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    assert!(wait_for(|| session.asr.has_listener(), 1000).await);

    // Two silent frames buffer up, then voiced frames arrive. The check
    // window trails the buffer, so the edge fires once a voiced frame
    // reaches it — and the whole buffer flushes at once.
    for _ in 0..2 {
        session.conn.push_binary(vec![0u8; 640]).await;
    }
    for _ in 0..4 {
        session.conn.push_binary(vec![1u8; 640]).await;
    }

    assert!(
        wait_for(
            || !session.asr.audio_calls.lock().unwrap().is_empty(),
            2000
        )
        .await,
        "rising edge should flush to the recognizer"
    );
    let first_flush = session.asr.audio_calls.lock().unwrap()[0];
    assert!(
        first_flush > 640,
        "first flush carries the whole buffer, got {} bytes",
        first_flush
    );

    // Continued voiced audio streams through frame by frame.
    session.conn.push_binary(vec![1u8; 640]).await;
    assert!(
        wait_for(
            || session.asr.audio_calls.lock().unwrap().len() >= 2,
            2000
        )
        .await
    );

    // 240 ms of silence ends the utterance.
    for _ in 0..12 {
        session.conn.push_binary(vec![0u8; 640]).await;
    }
    assert!(
        wait_for(
            || session.asr.finalize_calls.load(Ordering::Relaxed) >= 1,
            2000
        )
        .await,
        "silence threshold should close the utterance"
    );

    session.handler.close().await;
    let _ = session.run.await;
}

// ---------------------------------------------------------------------------
// Quick reply on the first round
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn wake_word_answers_from_quick_replies_without_model() {
    let mut config = Config::default();
    config.quick_reply = true;
    config.quick_reply_words = vec!["我在呢".into()];

    let session = start_session(SessionOptions {
        config,
        llm_responses: vec![vec![content_chunk("should not be needed")]],
        ..Default::default()
    });

    session.conn.push_json(pcm_hello()).await;
    session
        .conn
        .push_json(json!({"type": "chat", "text": "你好"}))
        .await;

    assert!(
        wait_for(
            || tts_states(&session.conn.sent_events()).iter().any(|s| s == "stop"),
            5000
        )
        .await
    );

    assert_eq!(session.llm.call_count(), 0, "wake word bypasses the model");
    assert_eq!(session.tts.synth_count(), 1);
    assert_eq!(session.tts.texts.lock().unwrap()[0], "我在呢");

    session.handler.close().await;
    let _ = session.run.await;

    // Drop the cache entry this test created in the working directory.
    let _ = std::fs::remove_dir_all("cache/quick_reply");
}
