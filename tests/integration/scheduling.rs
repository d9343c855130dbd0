use std::time::Duration;

use motionbus_core::CodeChannel;
use motionbus_services::{CodeError, SchedulerSettings};

use crate::*;

#[tokio::test]
async fn codes_leave_in_enqueue_order_with_priority_first() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let mut handles = Vec::new();
    for text in ["G0 X1", "G1 X2", "G2 X3 Y3 I1", "G3 X4 Y4 J1"] {
        handles.push(store.enqueue(code(text, CodeChannel::Http)).await);
    }
    handles.push(store.enqueue_priority(code("M400", CodeChannel::Http)).await);

    settle(&store, &mut link).await;
    let sent = link.transfer()?;
    assert_eq!(code_names(&sent), ["M400", "G0", "G1", "G2", "G3"]);
    assert!(sent
        .iter()
        .all(|s| matches!(s, Sent::Code { channel: CodeChannel::Http, .. })));

    // replies are matched strictly in the order the codes went out
    for reply in ["m400", "g0", "g1", "g2", "g3"] {
        assert!(store.handle_code_reply(reply_on(CodeChannel::Http), reply).await);
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.context("code dropped")??.to_string());
    }
    assert_eq!(results, ["g0", "g1", "g2", "g3", "m400"]);
    Ok(())
}

#[tokio::test]
async fn full_transmit_buffer_defers_codes_to_next_transfer() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    // room for two parameterless codes
    let mut link = FirmwareLink::new(64);

    for text in ["G28", "M17", "M114"] {
        let _ = store.enqueue(code(text, CodeChannel::Usb)).await;
    }

    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G28", "M17"]);

    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["M114"]);

    settle(&store, &mut link).await;
    assert!(link.transfer()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn flush_on_idle_channel_resolves_without_a_transfer() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let flush = store.flush(CodeChannel::Telnet).await;
    settle(&store, &mut link).await;

    assert_eq!(flush.await, Some(true));
    assert!(link.transfer()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn flush_waits_for_replies_to_codes_in_flight() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let _ = store.enqueue(code("G28", CodeChannel::Aux)).await;
    let mut flush = store.flush(CodeChannel::Aux).await;
    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G28"]);

    let early = tokio::time::timeout(Duration::from_millis(20), &mut flush).await;
    assert!(early.is_err(), "flush resolved while G28 was still running");

    assert!(store.handle_code_reply(reply_on(CodeChannel::Aux), "").await);
    settle(&store, &mut link).await;
    assert_eq!(flush.await, Some(true));
    Ok(())
}

#[tokio::test]
async fn replies_are_routed_by_channel() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let mut http = store.enqueue(code("M115", CodeChannel::Http)).await;
    let usb = store.enqueue(code("M115", CodeChannel::Usb)).await;
    settle(&store, &mut link).await;
    assert_eq!(link.transfer()?.len(), 2);

    assert!(store.handle_code_reply(reply_on(CodeChannel::Usb), "usb answer").await);
    assert_eq!(usb.await.context("usb code dropped")??.to_string(), "usb answer");
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut http)
        .await
        .is_err());

    assert!(store.handle_code_reply(reply_on(CodeChannel::Http), "http answer").await);
    assert_eq!(http.await.context("http code dropped")??.to_string(), "http answer");
    Ok(())
}

#[tokio::test]
async fn lock_is_sent_once_and_waits_for_confirmation() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let mut lock = store.lock(CodeChannel::Sbc).await;
    settle(&store, &mut link).await;
    assert_eq!(link.transfer()?, [Sent::Lock(CodeChannel::Sbc)]);

    settle(&store, &mut link).await;
    assert!(link.transfer()?.is_empty());
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut lock)
        .await
        .is_err());

    assert!(store.handle_locked(CodeChannel::Sbc).await);
    assert_eq!(lock.await, Some(true));

    let unlock = store.unlock(CodeChannel::Sbc).await;
    settle(&store, &mut link).await;
    assert_eq!(link.transfer()?, [Sent::Unlock(CodeChannel::Sbc)]);
    assert_eq!(unlock.await, Some(true));
    Ok(())
}

#[tokio::test]
async fn reset_invalidates_only_channels_with_work() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let buffered = store.enqueue(code("G1 X10", CodeChannel::File)).await;
    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G1"]);
    let pending = store.enqueue(code("M400", CodeChannel::Aux)).await;

    let results = store.invalidate_all("controller has been reset").await;
    let with_work: Vec<CodeChannel> = results
        .iter()
        .filter(|(_, had_work)| *had_work)
        .map(|(channel, _)| *channel)
        .collect();
    assert_eq!(with_work, [CodeChannel::File, CodeChannel::Aux]);
    assert_eq!(results.len(), CodeChannel::ALL.len());

    for handle in [buffered, pending] {
        match handle.await {
            Some(Err(CodeError::Cancelled(reason))) => {
                assert_eq!(reason, "controller has been reset")
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    // nothing moves until the next completed transfer unblocks the channels
    let _ = store.enqueue(code("G28", CodeChannel::File)).await;
    settle(&store, &mut link).await;
    assert!(link.transfer()?.is_empty());

    store.reset_blocked().await;
    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G28"]);
    Ok(())
}
