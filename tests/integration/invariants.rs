//! Randomized operation sequences against a single channel.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use motionbus_core::CodeChannel;
use motionbus_services::{ChannelInformation, FileResolver, FirmwareExecutor, SchedulerSettings};

use crate::*;

/// Every code used here has one numeric parameter, so all of them occupy
/// the same number of bytes in the firmware's buffer.
const CODE_SIZE: usize = 32;

const SEEDS: [u64; 4] = [1, 7, 42, 2024];

fn check_budget(channel: &ChannelInformation, step: usize, op: &str) {
    assert_eq!(
        channel.bytes_buffered(),
        channel.buffered_len() * CODE_SIZE,
        "step {step} ({op}): bytes in flight disagree with buffered codes"
    );
}

#[tokio::test]
async fn bytes_buffered_tracks_buffered_codes() -> Result<()> {
    let card = ScratchCard::new();
    card.write_macro("nested.g", "G1 X1\nG1 X2\nG1 X3\n");
    let resolver = FileResolver::new(&card.path);

    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let settings = SchedulerSettings {
            max_buffer_space: CODE_SIZE * 4,
            buffered_macro_codes: 2,
        };
        let mut channel = ChannelInformation::new(CodeChannel::Usb, settings, Arc::new(FirmwareExecutor));
        let mut link = FirmwareLink::new(8192);
        let mut handles = Vec::new();

        for step in 0..400 {
            let op = match rng.gen_range(0..10) {
                0..=2 => {
                    let text = format!("G1 X{}", rng.gen_range(0..1000));
                    handles.push(channel.enqueue(code(&text, CodeChannel::Usb)));
                    "enqueue"
                }
                3 => {
                    let text = format!("M204 P{}", rng.gen_range(0..1000));
                    handles.push(channel.enqueue_priority(code(&text, CodeChannel::Usb)));
                    "enqueue priority"
                }
                4..=5 => {
                    for _ in 0..rng.gen_range(1..4) {
                        if !channel.process_requests(&mut link).await {
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                    "process"
                }
                6..=7 => {
                    let _ = channel.handle_reply(reply_on(CodeChannel::Usb), "ok");
                    "reply"
                }
                8 => {
                    if channel.macro_depth() < 3 {
                        let from_code = rng.gen_bool(0.5);
                        channel
                            .handle_macro_request("nested.g", true, from_code, &resolver, &mut link)
                            .await;
                    }
                    "macro"
                }
                _ => {
                    channel.reset_blocked();
                    if rng.gen_bool(0.1) {
                        channel.abort_file(rng.gen_bool(0.3));
                    }
                    link.transfer()?;
                    "transfer"
                }
            };
            check_budget(&channel, step, op);
            assert!(channel.bytes_buffered() <= CODE_SIZE * 4, "budget exceeded at step {step}");
        }

        channel.invalidate("done");
        check_budget(&channel, usize::MAX, "invalidate");
        for handle in handles.drain(..) {
            assert!(handle.await.is_some(), "seed {seed}: a code was dropped unresolved");
        }
    }
    Ok(())
}

/// Codes displaced by a macro come back in their original order.
#[tokio::test]
async fn resumed_codes_keep_their_order() -> Result<()> {
    let card = ScratchCard::new();
    card.write_macro("filament-change.g", "M83\n");
    let resolver = FileResolver::new(&card.path);

    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let count = rng.gen_range(2..8);
        let mut channel = ChannelInformation::new(
            CodeChannel::Aux,
            SchedulerSettings::default(),
            Arc::new(FirmwareExecutor),
        );
        let mut link = FirmwareLink::new(8192);

        let majors: Vec<i32> = (0..count).map(|i| i * 10 + rng.gen_range(0..10)).collect();
        let expected: Vec<String> = majors.iter().map(|m| format!("G{m}")).collect();
        for major in &majors {
            let _ = channel.enqueue(code(&format!("G{major} X1"), CodeChannel::Aux));
        }
        while channel.process_requests(&mut link).await {}
        assert_eq!(code_names(&link.transfer()?), expected);

        channel
            .handle_macro_request("filament-change.g", true, false, &resolver, &mut link)
            .await;
        assert_eq!(channel.suspended_len(), count as usize);
        channel.reset_blocked();

        // run the macro to its end
        for _ in 0..16 {
            while channel.process_requests(&mut link).await {}
            tokio::task::yield_now().await;
        }
        assert!(channel.handle_reply(reply_on(CodeChannel::Aux), ""));
        for _ in 0..4 {
            while channel.process_requests(&mut link).await {}
            tokio::task::yield_now().await;
        }
        assert!(channel.handle_reply(reply_on(CodeChannel::Aux), ""));
        while channel.process_requests(&mut link).await {}

        let sent = link.transfer()?;
        let names = code_names(&sent);
        assert_eq!(names[0], "M83", "seed {seed}");
        assert_eq!(&names[1..], expected.as_slice(), "seed {seed}");
        assert_eq!(channel.suspended_len(), 0);
        check_budget(&channel, 0, "resume");
    }
    Ok(())
}
