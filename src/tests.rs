use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::*;
use crate::runtime::with_rt;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn idle_scheduler_reports_zero() {
    init();
    assert_eq!(execute_actives(), 0);
    let before = num_loops();
    execute_actives();
    assert_eq!(num_loops(), before + 1);
}

#[test]
fn producer_consumer_drain() {
    init();
    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    let chan = Channel::<i32>::create(3);
    start(move || {
        for v in [100, 101, 102, 103, 104] {
            assert!(chan.push(v));
        }
        chan.close();
    });
    run(move || {
        while let Some(v) = chan.pull() {
            got2.borrow_mut().push(v);
        }
        // Closed and drained: pulling keeps failing.
        assert!(chan.pull().is_none());
    });
    assert_eq!(*got.borrow(), vec![100, 101, 102, 103, 104]);
}

#[test]
fn close_keeps_buffered_elements_pullable() {
    init();
    let chan = Channel::<u8>::create(4);
    assert!(chan.push(1));
    assert!(chan.push(2));
    assert!(chan.close());
    assert!(!chan.close());
    assert!(!chan.push(3));
    run(move || {
        assert_eq!(chan.pull(), Some(1));
        assert_eq!(chan.pull(), Some(2));
        assert!(chan.pull().is_none());
    });
}

#[test]
fn handle_goes_stale_and_slot_reuse_bumps_age() {
    init();
    let h = start(|| {});
    assert!(!is_handle(h));
    let h2 = start(|| {});
    assert_eq!(h2.id, h.id, "expected the freed slot to be recycled");
    assert!(h2.age > h.age, "slot reuse must bump the age");
    assert!(!is_handle(h));
}

#[test]
fn child_runs_on_a_later_iteration() {
    init();
    let order = Rc::new(RefCell::new(Vec::new()));
    let order2 = order.clone();
    run(move || {
        // Get out of the immediate-resume segment and into a scheduler
        // iteration proper.
        yield_now();
        let o = order2.clone();
        start(move || o.borrow_mut().push("child"));
        order2.borrow_mut().push("parent-segment-1");
        yield_now();
        order2.borrow_mut().push("parent-segment-2");
    });
    assert_eq!(
        *order.borrow(),
        vec!["parent-segment-1", "parent-segment-2", "child"]
    );
}

#[test]
fn join_many_resumes_after_slowest() {
    init();
    let started = Instant::now();
    let joined_after = Rc::new(Cell::new(Duration::ZERO));
    let joined = joined_after.clone();
    run(move || {
        let a = start(|| sleep(ms(250)));
        let b = start(|| sleep(ms(100)));
        let c = start(|| sleep(ms(150)));
        wait_all(&[a, b, c]);
        joined.set(started.elapsed());
    });
    let e = joined_after.get();
    assert!(e >= ms(250), "joined too early: {:?}", e);
    assert!(e < ms(1000), "joined too late: {:?}", e);
}

#[test]
fn wait_returns_the_timeout_index() {
    init();
    run(|| {
        let chan = Channel::<u8>::create(1);
        let events = [
            WatchedEvent::can_pull(chan.handle()),
            WatchedEvent::timeout(ms(30)),
        ];
        assert_eq!(wait(&events), Some(1));
    });
}

#[test]
fn wait_fast_path_takes_first_ready_index() {
    init();
    run(|| {
        let a = Channel::<u8>::create(1);
        let b = Channel::<u8>::create(1);
        assert!(b.push(9));
        let events = [
            WatchedEvent::can_pull(a.handle()),
            WatchedEvent::can_push(a.handle()),
            WatchedEvent::can_pull(b.handle()),
        ];
        // `a` is empty but pushable, so index 1 is the first ready one.
        assert_eq!(wait(&events), Some(1));
    });
}

#[test]
fn no_waiter_leaks_after_wait_returns() {
    init();
    let chan = Channel::<u8>::create(1);
    run(move || {
        let events = [
            WatchedEvent::can_pull(chan.handle()),
            WatchedEvent::timeout(ms(20)),
        ];
        assert_eq!(wait(&events), Some(1));
        with_rt(|rt| {
            let c = rt.channels.resolve(chan.handle()).unwrap();
            assert!(c.header().pull_waiters.is_empty(), "pull waiter leaked");
        });
    });
}

#[test]
fn push_wakes_at_most_one_consumer_in_fifo_order() {
    init();
    let chan = Channel::<u8>::create(1);
    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    run(move || {
        for i in 0..2u8 {
            let g = got2.clone();
            start(move || {
                if let Some(v) = chan.pull() {
                    g.borrow_mut().push((i, v));
                }
            });
        }
        sleep(ms(20)); // both consumers are parked now
        assert!(chan.push(7));
        sleep(ms(20));
        assert_eq!(*got2.borrow(), vec![(0, 7)]);
        chan.close();
    });
    assert_eq!(*got.borrow(), vec![(0, 7)]);
}

#[test]
fn fan_in_with_timeout() {
    init();
    let a = Channel::<&'static str>::create(1);
    let b = Channel::<&'static str>::create(1);
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let outcomes2 = outcomes.clone();
    run(move || {
        start(move || {
            for _ in 0..3 {
                if !a.push("john") {
                    return;
                }
                sleep(ms(30));
            }
        });
        start(move || {
            for _ in 0..2 {
                if !b.push("peter") {
                    return;
                }
                sleep(ms(70));
            }
        });
        let o = outcomes2.clone();
        let reader = start(move || {
            let mut iteration_start = Instant::now();
            for _ in 0..8 {
                let mut arm_a = if_can_pull(a, |_| {});
                let mut arm_b = if_can_pull(b, |_| {});
                let mut arm_t = if_timeout(ms(40), || {});
                match choose(&mut [
                    &mut arm_a as &mut dyn ChooseArm,
                    &mut arm_b,
                    &mut arm_t,
                ]) {
                    Some(2) => {
                        let waited = iteration_start.elapsed();
                        assert!(waited >= ms(35), "timeout fired after {:?}", waited);
                        o.borrow_mut().push(2);
                    }
                    Some(i) => o.borrow_mut().push(i),
                    None => o.borrow_mut().push(99),
                }
                iteration_start = Instant::now();
            }
        });
        join(reader);
        a.close();
        b.close();
    });
    let o = outcomes.borrow();
    assert!(o.iter().all(|&i| i <= 2), "unexpected outcomes: {:?}", o);
    assert!(o.contains(&2), "the timeout arm never fired: {:?}", o);
}

#[test]
fn periodic_ticker_bounded_by_after() {
    init();
    let ticks = Rc::new(Cell::new(0));
    let ticks2 = ticks.clone();
    let started = Instant::now();
    run(move || {
        let ticker = every(ms(60));
        let deadline = after(ms(150));
        start(move || {
            while ticker.pull().is_some() {
                ticks2.set(ticks2.get() + 1);
            }
            // Once closed, pulls keep failing.
            assert!(ticker.pull().is_none());
        });
        start(move || {
            assert!(deadline.pull().is_some());
            ticker.close();
        });
    });
    let n = ticks.get();
    assert!((1..=3).contains(&n), "saw {} ticks", n);
    let e = started.elapsed();
    assert!(e >= ms(150) && e < ms(600), "took {:?}", e);
}

#[test]
fn periodic_timestamps_are_spaced_by_the_interval() {
    init();
    let stamps = Rc::new(RefCell::new(Vec::new()));
    let stamps2 = stamps.clone();
    run(move || {
        let ticker = every(ms(20));
        for _ in 0..4 {
            stamps2.borrow_mut().push(ticker.pull().unwrap());
        }
        ticker.close();
    });
    let stamps = stamps.borrow();
    assert_eq!(stamps.len(), 4);
    for pair in stamps.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= ms(15), "ticks only {:?} apart", gap);
    }
}

#[test]
fn after_fires_once_then_closes_itself() {
    init();
    let fired = after(ms(30));
    run(move || {
        assert!(fired.pull().is_some());
        assert!(fired.pull().is_none());
    });
}

#[test]
fn time_to_next_event_counts_down_to_zero() {
    init();
    let t = after(ms(500));
    let left = t.time_to_next_event();
    assert!(left > ms(300) && left <= ms(500), "reported {:?}", left);
    assert!(t.close());
    assert_eq!(t.time_to_next_event(), Duration::ZERO);
    assert!(t.pull().is_none());
}

#[test]
fn named_events_broadcast_and_latch() {
    init();
    run(|| {
        let woken = Rc::new(Cell::new(0));
        let ev = create_event(false, Some("go"));
        assert!(is_valid_event(ev));
        for _ in 0..3 {
            let w = woken.clone();
            start(move || {
                wait_event(ev);
                w.set(w.get() + 1);
            });
        }
        sleep(ms(20)); // let the waiters attach
        assert_eq!(woken.get(), 0);
        assert!(set_event(ev));
        assert!(is_event_set(ev));
        // Latched: a late waiter takes the fast path.
        let w = woken.clone();
        let late = start(move || {
            wait_event(ev);
            w.set(w.get() + 1);
        });
        join(late);
        assert_eq!(woken.get(), 4);
        assert!(clear_event(ev));
        assert!(!is_event_set(ev));
        assert!(destroy_event(ev));
        assert!(!is_valid_event(ev));
        assert!(!set_event(ev));
    });
}

#[test]
fn destroying_an_event_wakes_its_waiters() {
    init();
    let woke = Rc::new(Cell::new(false));
    let woke2 = woke.clone();
    run(move || {
        let ev = create_event(false, None);
        let w = woke2.clone();
        let h = start(move || {
            wait_event(ev);
            w.set(true);
        });
        sleep(ms(20));
        assert!(destroy_event(ev));
        join(h);
    });
    assert!(woke.get());
}

#[test]
fn condition_wait_resumes_when_predicate_clears() {
    init();
    let flag = Rc::new(Cell::new(false));
    let order = Rc::new(RefCell::new(Vec::new()));
    let flag2 = flag.clone();
    let order2 = order.clone();
    run(move || {
        let f = flag2.clone();
        let o = order2.clone();
        let waiter = start(move || {
            let f2 = f.clone();
            wait_while(move || !f2.get());
            o.borrow_mut().push("woken");
        });
        sleep(ms(30));
        order2.borrow_mut().push("set");
        flag2.set(true);
        join(waiter);
    });
    assert_eq!(*order.borrow(), vec!["set", "woken"]);
}

#[test]
fn exit_co_detaches_the_target_and_wakes_joiners() {
    init();
    let observed = Rc::new(Cell::new(false));
    let observed2 = observed.clone();
    let chan = Channel::<u8>::create(1);
    run(move || {
        let blocked = start(move || {
            let _ = chan.pull();
        });
        sleep(ms(20)); // let it park on the channel
        let o = observed2.clone();
        let watcher = start(move || {
            join(blocked);
            o.set(true);
        });
        sleep(ms(20));
        exit_co(blocked);
        assert!(!is_handle(blocked));
        join(watcher);
        with_rt(|rt| {
            let c = rt.channels.resolve(chan.handle()).unwrap();
            assert!(c.header().pull_waiters.is_empty(), "pull waiter leaked");
        });
    });
    assert!(observed.get());
}

struct DropFlag(Rc<Cell<bool>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn exit_co_on_current_unwinds_the_stack() {
    init();
    let dropped = Rc::new(Cell::new(false));
    let dropped2 = dropped.clone();
    run(move || {
        let d = dropped2.clone();
        let h = start(move || {
            let _guard = DropFlag(d);
            exit_co(current());
            unreachable!("exit_co(current()) returned");
        });
        join(h);
    });
    assert!(dropped.get(), "locals were not dropped on exit_co");
}

#[test]
fn choose_reports_a_failed_arm() {
    init();
    let chan = Channel::<u8>::create(1);
    run(move || {
        let watcher = start(move || {
            let mut arm = if_can_pull(chan, |_| {});
            // Woken because the channel closes; the pull then fails.
            assert_eq!(choose(&mut [&mut arm as &mut dyn ChooseArm]), None);
        });
        sleep(ms(20));
        chan.close();
        join(watcher);
    });
}

#[test]
fn choose_runs_the_timer_arm() {
    init();
    let fired_at = Rc::new(RefCell::new(None));
    let fired_at2 = fired_at.clone();
    run(move || {
        let ticker = every(ms(30));
        let f = fired_at2.clone();
        let mut arm_t = if_timer_fires(ticker, move |ts| {
            *f.borrow_mut() = Some(ts);
        });
        let chan = Channel::<u8>::create(1);
        let mut arm_c = if_can_pull(chan, |_| {});
        let picked = choose(&mut [&mut arm_c as &mut dyn ChooseArm, &mut arm_t]);
        assert_eq!(picked, Some(1));
        ticker.close();
    });
    assert!(fired_at.borrow().is_some());
}

#[test]
fn stale_channel_handles_fail_cleanly() {
    init();
    let chan = Channel::<u8>::create(1);
    let stale = ChanHandle::from_u32(chan.handle().as_u32() ^ 0xffff_0000);
    assert!(is_channel(chan.handle()));
    assert!(!is_channel(stale));
    assert!(!pull_discard(stale));
    assert!(!close_channel(stale));
}

#[test]
fn pull_discard_drains_one_element() {
    init();
    let chan = Channel::<String>::create(2);
    assert!(chan.push("noise".to_string()));
    assert!(chan.push("keep".to_string()));
    assert!(pull_discard(chan.handle()));
    run(move || {
        assert_eq!(chan.pull().as_deref(), Some("keep"));
        chan.close();
    });
}

#[test]
fn cascade_of_channels() {
    init();
    const N: usize = 1000;
    let chans: Vec<Channel<i32>> = (0..N).map(|_| Channel::create(1)).collect();
    for i in 0..N - 1 {
        let src = chans[i];
        let dst = chans[i + 1];
        start(move || {
            while let Some(v) = src.pull() {
                if !dst.push(v + 1) {
                    break;
                }
            }
        });
    }
    let result = Rc::new(Cell::new(0));
    let result2 = result.clone();
    run(move || {
        assert!(chans[0].push(1));
        let v = chans[N - 1].pull().expect("cascade lost the value");
        result2.set(v);
        for c in &chans {
            c.close();
        }
    });
    assert_eq!(result.get(), N as i32);
}

#[test]
fn socket_echo() {
    init();
    let result = Rc::new(RefCell::new(Vec::new()));
    let result2 = result.clone();
    run(move || {
        let listener = tcp::TcpListener::bind("127.0.0.1", 0).expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        let server = start(move || {
            let mut listener = listener;
            let mut client = listener.accept().expect("accept");
            let mut buf = [0u8; 256];
            let n = client.recv_up_to(&mut buf).expect("server recv");
            assert!(n > 0);
            assert!(client.send(&buf[..n]));
            client.close();
            listener.close();
        });
        let r = result2.clone();
        let client = start(move || {
            let mut conn = tcp::TcpStream::connect("127.0.0.1", port).expect("connect");
            assert!(conn.send(b"Hello"));
            let mut buf = [0u8; 256];
            let n = conn.recv_up_to(&mut buf).expect("client recv");
            r.borrow_mut().extend_from_slice(&buf[..n]);
            conn.close();
        });
        wait_all(&[server, client]);
    });
    assert_eq!(&*result.borrow(), b"Hello");
}

#[test]
fn recv_fills_the_buffer_exactly() {
    init();
    run(|| {
        let listener = tcp::TcpListener::bind("127.0.0.1", 0).expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        let server = start(move || {
            let client = listener.accept().expect("accept");
            // Two writes; the peer recv()s them as one 8-byte read.
            assert!(client.send(b"abcd"));
            sleep(ms(20));
            assert!(client.send(b"efgh"));
        });
        let mut conn = tcp::TcpStream::connect("127.0.0.1", port).expect("connect");
        let mut buf = [0u8; 8];
        assert!(conn.recv(&mut buf));
        assert_eq!(&buf, b"abcdefgh");
        // Orderly shutdown surfaces as a zero-length recv_up_to.
        join(server);
        let mut rest = [0u8; 8];
        assert_eq!(conn.recv_up_to(&mut rest), Some(0));
        conn.close();
    });
}

#[test]
fn file_roundtrip() {
    init();
    let path = std::env::temp_dir().join(format!("corio-file-test-{}.bin", std::process::id()));
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let data2 = data.clone();
    let path2 = path.clone();
    run(move || {
        assert!(file::save_file(&path2, &data2));
        let loaded = file::load_file(&path2).expect("load");
        assert_eq!(loaded, data2);
    });
    let _ = std::fs::remove_file(&path);
    assert!(file::load_file("/definitely/not/here").is_none());
    assert!(!file::save_file("/definitely/not/here/file", b"x"));
}

#[test]
fn coroutine_panics_propagate_to_the_embedder() {
    init();
    let caught = std::panic::catch_unwind(|| {
        run(|| {
            panic!("boom");
        });
    });
    assert!(caught.is_err());
}
