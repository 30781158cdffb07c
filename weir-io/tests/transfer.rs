use std::sync::{Arc, Barrier};
use std::thread;

use futures::executor::block_on;
use weir_io::{
    ClientHandle, Direction, Dispatch, Outcome, Request, RequestState, TransferController,
};

mod util;

use util::Recorder;

const CLIENT: ClientHandle = ClientHandle::new(7);

#[test]
fn partial_write_completes_from_read_cascade() {
    util::init_logging();
    let tc = TransferController::new(4);

    let (write, written) = Request::write(CLIENT, &b"ABCDE"[..]);
    match tc.handle_outbound(write) {
        Dispatch::Pending { transferred, .. } => assert_eq!(transferred, 4),
        Dispatch::Completed => panic!("write should be queued"),
    }
    assert_eq!(tc.queued(Direction::Outbound), 1);
    assert_eq!(tc.buffer().free_space(), 0);

    let (read, data) = Request::read(CLIENT, 10);
    assert!(!tc.handle_inbound(read).is_pending());

    let read = block_on(data);
    assert_eq!(read.state(), RequestState::CompletedSync);
    assert_eq!(&read.data()[..], b"ABCD");

    let written = block_on(written);
    assert_eq!(written.state(), RequestState::CompletedAsync);
    assert_eq!(written.result(), Ok(5));

    assert_eq!(tc.queued(Direction::Outbound), 0);
    assert_eq!(&tc.buffer().consume(10)[..], b"E");
}

#[test]
fn cancel_all_for_one_client() {
    util::init_logging();
    let tc = TransferController::new(16);
    let other = ClientHandle::new(8);
    let recorder = Recorder::new();

    let mut ids = vec![];
    for _ in 0..3 {
        let read = Request::read_with(CLIENT, 4, recorder.hook());
        ids.push(read.id());
        assert!(tc.handle_inbound(read).is_pending());
    }
    let (read, _other_read) = Request::read(other, 4);
    let _ = tc.handle_inbound(read);
    assert_eq!(tc.queued(Direction::Inbound), 4);

    assert_eq!(tc.cancel_all(CLIENT), 3);
    assert_eq!(recorder.len(), 3);
    for id in ids {
        assert_eq!(recorder.get(id).unwrap().outcome(), Outcome::Cancelled);
    }
    assert_eq!(tc.queued(Direction::Inbound), 1);
    assert_eq!(tc.cancel_all(CLIENT), 0);
}

#[test]
fn write_of_exactly_free_space_completes_synchronously() {
    util::init_logging();
    let tc = TransferController::new(8);

    let (write, _) = Request::write(CLIENT, &b"abc"[..]);
    let _ = tc.handle_outbound(write);
    let free = tc.buffer().free_space();
    assert_eq!(free, 5);

    let (write, written) = Request::write(CLIENT, vec![b'x'; free]);
    assert!(!tc.handle_outbound(write).is_pending());
    let written = block_on(written);
    assert_eq!(written.state(), RequestState::CompletedSync);
    assert_eq!(written.result(), Ok(5));
    assert_eq!(tc.buffer().free_space(), 0);
}

#[test]
fn write_of_one_more_byte_is_partial() {
    util::init_logging();
    let tc = TransferController::new(8);

    let (write, written) = Request::write(CLIENT, vec![b'x'; 9]);
    let dispatch = tc.handle_outbound(write);
    let Dispatch::Pending { cancel, transferred } = dispatch else {
        panic!("write should be queued");
    };
    assert_eq!(transferred, 8);
    assert_eq!(tc.queued(Direction::Outbound), 1);

    assert!(cancel.cancel());
    let written = block_on(written);
    assert_eq!(written.outcome(), Outcome::Cancelled);
    assert_eq!(written.transferred(), 8);
}

#[test]
fn round_trip_across_splits() {
    util::init_logging();
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    for capacity in [1, 2, 3, 7, 64, 4096] {
        for (write_chunk, read_len) in [(1, 1), (3, 5), (17, 4), (250, 333), (1000, 1000)] {
            let tc = TransferController::new(capacity);

            let mut writes = vec![];
            for chunk in payload.chunks(write_chunk) {
                let (write, written) = Request::write(CLIENT, chunk.to_vec());
                let _ = tc.handle_outbound(write);
                writes.push((chunk.len(), written));
            }

            let mut received = Vec::with_capacity(payload.len());
            while received.len() < payload.len() {
                let (read, data) = Request::read(CLIENT, read_len);
                assert!(
                    !tc.handle_inbound(read).is_pending(),
                    "capacity={capacity} chunk={write_chunk} read={read_len}"
                );
                received.extend_from_slice(&block_on(data).into_data());
            }

            assert_eq!(received, payload, "capacity={capacity} chunk={write_chunk}");
            for (len, written) in writes {
                assert_eq!(block_on(written).result(), Ok(len));
            }
            assert!(tc.buffer().is_empty());
            assert_eq!(tc.queued(Direction::Outbound), 0);
        }
    }
}

#[test]
fn drain_and_cancel_race_completes_once() {
    util::init_logging();
    for round in 0..500 {
        let tc = Arc::new(TransferController::new(4));
        let recorder = Recorder::new();
        let read = Request::read_with(CLIENT, 4, recorder.hook());
        let id = read.id();
        let cancel = match tc.handle_inbound(read) {
            Dispatch::Pending { cancel, .. } => cancel,
            Dispatch::Completed => panic!("read should be queued"),
        };

        let barrier = Arc::new(Barrier::new(2));
        let drainer = {
            let tc = tc.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                assert_eq!(tc.buffer().append(b"wxyz"), 4);
                tc.drain_inbound();
            })
        };
        barrier.wait();
        let cancelled = cancel.cancel();
        drainer.join().unwrap();

        assert_eq!(recorder.count(id), 1, "round {round}");
        let completion = recorder.get(id).unwrap();
        if cancelled {
            assert_eq!(completion.outcome(), Outcome::Cancelled, "round {round}");
            assert_eq!(tc.buffer().len(), 4, "round {round}");
        } else {
            assert_eq!(completion.outcome(), Outcome::Success(4), "round {round}");
            assert_eq!(&completion.data()[..], b"wxyz");
            assert!(tc.buffer().is_empty(), "round {round}");
        }
        assert_eq!(tc.queued(Direction::Inbound), 0);
    }
}

#[test]
fn cancel_races_stalled_drain() {
    util::init_logging();
    for round in 0..1000 {
        let tc = Arc::new(TransferController::new(4));
        let recorder = Recorder::new();
        let read = Request::read_with(CLIENT, 4, recorder.hook());
        let id = read.id();
        let handle = match tc.handle_inbound(read) {
            Dispatch::Pending { cancel, .. } => cancel,
            Dispatch::Completed => panic!("read should be queued"),
        };

        let barrier = Arc::new(Barrier::new(2));
        let drainer = {
            let tc = tc.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    assert!(!tc.drain_inbound());
                }
            })
        };
        barrier.wait();
        // Alternate between cancelling by identity and through the handle.
        if round % 2 == 0 {
            tc.cancel(id);
        } else {
            handle.cancel();
        }
        drainer.join().unwrap();

        assert_eq!(recorder.count(id), 1, "round {round}");
        assert_eq!(
            recorder.get(id).unwrap().outcome(),
            Outcome::Cancelled,
            "round {round}"
        );
        assert_eq!(tc.queued(Direction::Inbound), 0, "round {round}");
    }
}

#[test]
fn drain_calls_are_noops_when_idle() {
    util::init_logging();
    let tc = TransferController::new(4);
    assert!(!tc.drain_inbound());
    assert!(!tc.drain_outbound());

    let (read, data) = Request::read(CLIENT, 2);
    let _ = tc.handle_inbound(read);
    assert_eq!(tc.buffer().append(b"hi"), 2);
    assert!(tc.drain_inbound());
    assert_eq!(&block_on(data).data()[..], b"hi");
    assert!(!tc.drain_inbound());
}
