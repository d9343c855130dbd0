use std::time::Duration;

use motionbus_core::CodeChannel;
use motionbus_services::SchedulerSettings;

use crate::*;

/// A pause macro requested by the firmware while one code is in flight and
/// another is still queued.
#[tokio::test]
async fn pause_macro_suspends_buffered_code_and_holds_pending() -> Result<()> {
    let card = ScratchCard::new();
    card.write_macro("pause.g", "M83\nG1 E-2\n");
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    let mut first = store.enqueue(code("G0 X10", CodeChannel::File)).await;
    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G0"]);
    let second = store.enqueue(code("G4 P100", CodeChannel::File)).await;

    store
        .handle_macro_request(CodeChannel::File, "pause.g", true, false, &mut link)
        .await;
    {
        let channel = store.lock_channel(CodeChannel::File).await;
        assert_eq!(channel.macro_depth(), 1);
        assert_eq!(channel.suspended_len(), 1);
        assert_eq!(channel.buffered_len(), 0);
        assert_eq!(channel.bytes_buffered(), 0);
        assert!(channel.is_blocked());
    }
    // suspended, not cancelled
    assert!(tokio::time::timeout(Duration::from_millis(20), &mut first)
        .await
        .is_err());

    // nothing moves on the channel until the next transfer completed
    settle(&store, &mut link).await;
    assert!(link.transfer()?.is_empty());
    store.reset_blocked().await;

    settle(&store, &mut link).await;
    let sent = link.transfer()?;
    assert_eq!(code_names(&sent), ["M83", "G1"]);
    assert!(!sent.iter().any(|s| matches!(s, Sent::MacroCompleted { .. })));

    for _ in 0..2 {
        assert!(store.handle_code_reply(reply_on(CodeChannel::File), "").await);
    }
    settle(&store, &mut link).await;
    assert_eq!(
        link.transfer()?,
        [Sent::MacroCompleted {
            channel: CodeChannel::File,
            error: false
        }]
    );

    // the firmware acknowledges the end of the macro; G0 goes out again
    // ahead of the code that was waiting all along
    assert!(store.handle_code_reply(reply_on(CodeChannel::File), "").await);
    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G0", "G4"]);

    assert!(store.handle_code_reply(reply_on(CodeChannel::File), "moved").await);
    assert!(store.handle_code_reply(reply_on(CodeChannel::File), "waited").await);
    assert_eq!(first.await.context("G0 dropped")??.to_string(), "moved");
    assert_eq!(second.await.context("G4 dropped")??.to_string(), "waited");
    Ok(())
}

#[tokio::test]
async fn missing_macro_still_reports_completion() -> Result<()> {
    let card = ScratchCard::new();
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    store
        .handle_macro_request(CodeChannel::Daemon, "daemon.g", false, false, &mut link)
        .await;
    store
        .handle_macro_request(CodeChannel::Lcd, "tpre0.g", true, false, &mut link)
        .await;

    assert_eq!(
        link.transfer()?,
        [
            Sent::MacroCompleted {
                channel: CodeChannel::Daemon,
                error: true
            },
            Sent::MacroCompleted {
                channel: CodeChannel::Lcd,
                error: true
            },
        ]
    );
    let channel = store.lock_channel(CodeChannel::Lcd).await;
    assert_eq!(channel.macro_depth(), 0);
    Ok(())
}

#[tokio::test]
async fn numbered_probe_macro_falls_back_to_generic_file() -> Result<()> {
    let card = ScratchCard::new();
    card.write_macro("deployprobe.g", "M280 P0 S10\n");
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    store
        .handle_macro_request(CodeChannel::Trigger, "deployprobe2.g", true, false, &mut link)
        .await;
    store.reset_blocked().await;
    settle(&store, &mut link).await;

    assert_eq!(code_names(&link.transfer()?), ["M280"]);
    Ok(())
}

#[tokio::test]
async fn aborted_macro_gives_way_to_queued_codes() -> Result<()> {
    let card = ScratchCard::new();
    card.write_macro("tool.g", "G91\nG1 Z5\nG90\n");
    let store = store_at(&card.path, SchedulerSettings::default());
    let mut link = FirmwareLink::new(8192);

    store
        .handle_macro_request(CodeChannel::Http, "tool.g", true, false, &mut link)
        .await;
    store.reset_blocked().await;
    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G91", "G1", "G90"]);

    let queued = store.enqueue(code("G28", CodeChannel::Http)).await;
    settle(&store, &mut link).await;
    assert!(link.transfer()?.is_empty(), "G28 overtook the running macro");

    store.abort_file(CodeChannel::Http, false).await;
    assert_eq!(store.lock_channel(CodeChannel::Http).await.macro_depth(), 0);
    assert_eq!(store.lock_channel(CodeChannel::Http).await.bytes_buffered(), 0);

    settle(&store, &mut link).await;
    assert_eq!(code_names(&link.transfer()?), ["G28"]);
    assert!(store.handle_code_reply(reply_on(CodeChannel::Http), "homed").await);
    assert_eq!(queued.await.context("G28 dropped")??.to_string(), "homed");
    Ok(())
}
