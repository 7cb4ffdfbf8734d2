//! Chain and transfer behavior across module boundaries: the documented
//! producer/consumer lifecycle, compression inside a running chain, and a
//! sequence-numbered UDP transfer end to end.

use byteorder::{ByteOrder, LittleEndian};
use flexrec::chain::{Chain, StepId, StepResult};
use flexrec::runtime::{Runtime, TransferMode};
use flexrec::trackmask;
use flexrec::transfer::{self, ReplyCode};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Gate {
    go: bool,
}

#[test]
fn chain_lifecycle_one_producer_two_consumers() {
    let consumed = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(AtomicUsize::new(0));

    let mut builder = Chain::builder().source::<Gate, u32, _, _>(
        "producer",
        1,
        4,
        || Gate { go: false },
        |h, out| -> StepResult {
            if !h.wait_until(|g| g.go) {
                return Ok(());
            }
            for i in 0..100u32 {
                if out.push(i).is_err() {
                    break;
                }
            }
            Ok(())
        },
    );
    {
        let finalized = finalized.clone();
        builder.register_final(move || {
            finalized.fetch_add(1, Ordering::SeqCst);
        });
    }
    let chain = builder.sink::<(), _, _>("consumer", 2, || (), {
        let consumed = consumed.clone();
        move |_h, input| -> StepResult {
            while input.pop().is_some() {
                consumed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    });

    chain.run().unwrap();
    // one producer thread plus two consumer threads
    assert_eq!(chain.live_workers(), 3);
    chain
        .communicate::<Gate, _>(StepId::FIRST, |g| g.go = true)
        .unwrap();
    chain.delayed_disable();
    chain.wait();
    assert_eq!(consumed.load(Ordering::SeqCst), 100);
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(chain.live_workers(), 0);
    chain.stop().unwrap();
    chain.stop().unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn compression_step_halves_the_data_in_flight() {
    // keep the upper 32 bits of every word: two words in, one word out
    let mask = 0xffff_ffff_0000_0000u64;
    let compressor = trackmask::compressor_for(mask, 16, 0).unwrap();
    let bytes_out = Arc::new(AtomicUsize::new(0));

    let chain = Chain::builder()
        .source::<(), Vec<u64>, _, _>("gen", 1, 4, || (), move |_h, out| -> StepResult {
            for _ in 0..50 {
                if out.push(vec![mask; 16]).is_err() {
                    break;
                }
            }
            Ok(())
        })
        .step::<(), Vec<u64>, _, _>("pack", 2, 4, || (), {
            let compressor = Arc::clone(&compressor);
            move |_h, input, output| -> StepResult {
                while let Some(words) = input.pop() {
                    let mut packed = Vec::new();
                    compressor.compress(&words, &mut packed)?;
                    if output.push(packed).is_err() {
                        break;
                    }
                }
                Ok(())
            }
        })
        .sink::<(), _, _>("count", 1, || (), {
            let bytes_out = bytes_out.clone();
            move |_h, input| -> StepResult {
                while let Some(words) = input.pop() {
                    assert!(words.iter().all(|&w| w == !0u64));
                    bytes_out.fetch_add(words.len() * 8, Ordering::SeqCst);
                }
                Ok(())
            }
        });
    chain.run().unwrap();
    chain.wait();
    chain.stop().unwrap();
    // 50 blocks of 16 words compressed 2:1
    assert_eq!(bytes_out.load(Ordering::SeqCst), 50 * 16 * 8 / 2);
}

#[test]
fn fill2net_over_udps_carries_sequence_numbers() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let port = receiver.local_addr().unwrap().port();

    let rte = Runtime::new();
    {
        let mut st = rte.lock();
        st.netparms.set_protocol("udps").unwrap();
        st.netparms.set_blocksize(8192).unwrap();
    }
    let port_s = port.to_string();
    let r = transfer::fill2net(false, &["connect", "127.0.0.1", &port_s], &rte);
    assert_eq!(r.code, ReplyCode::Ok, "{}", r);

    // write_size for mtu 1500 / udps is (1500 - 28 - 8) & !7 = 1464, and
    // the blocksize shrinks to an integral number of reads
    let sizes = rte.lock().sizes.clone().unwrap();
    use flexrec::Constraint;
    assert_eq!(sizes.get(Constraint::WriteSize), Some(1464));
    assert_eq!(sizes.get(Constraint::BlockSize), Some(7320));

    let r = transfer::fill2net(false, &["on", "0", "7320"], &rte);
    assert_eq!(r.code, ReplyCode::Ok, "{}", r);

    let mut buf = vec![0u8; 2048];
    let mut seqnos = Vec::new();
    let mut payload_total = 0usize;
    for _ in 0..5 {
        let n = receiver.recv(&mut buf).unwrap();
        assert!(n > 8);
        seqnos.push(LittleEndian::read_u64(&buf[..8]));
        payload_total += n - 8;
        // payload carries the default fill pattern
        assert_eq!(
            LittleEndian::read_u64(&buf[8..16]),
            0x1122_3344_1122_3344
        );
    }
    assert_eq!(seqnos, vec![0, 1, 2, 3, 4]);
    assert_eq!(payload_total, 7320);

    let deadline = Instant::now() + Duration::from_secs(10);
    while rte.mode() != TransferMode::NoTransfer && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(rte.mode(), TransferMode::NoTransfer);
}
