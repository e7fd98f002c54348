use super::*;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestEvent {
    A,
    B,
    C,
    Heartbeat,
}

struct MockSource {
    ready: VecDeque<bool>,
    timeouts: Vec<Option<Duration>>,
}

impl DataSource for MockSource {
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.timeouts.push(timeout);
        Ok(self.ready.pop_front().unwrap_or(false))
    }
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let mut run_loop = RunLoop::new();
    let start = Instant::now();

    run_loop.add_timer_at(start + Duration::from_millis(30), TestEvent::C);
    run_loop.add_timer_at(start + Duration::from_millis(10), TestEvent::A);
    run_loop.add_timer_at(start + Duration::from_millis(20), TestEvent::B);

    assert_eq!(run_loop.next_deadline(), Some(start + Duration::from_millis(10)));

    let mut fired = Vec::new();
    let count = run_loop.process_timers(start + Duration::from_millis(25), |_, _, event| fired.push(event));

    assert_eq!(count, 2);
    assert_eq!(fired, vec![TestEvent::A, TestEvent::B]);
    assert_eq!(run_loop.len(), 1);
}

#[test]
fn test_equal_deadlines_keep_insertion_order() {
    let mut run_loop = RunLoop::new();
    let deadline = Instant::now();

    run_loop.add_timer_at(deadline, TestEvent::B);
    run_loop.add_timer_at(deadline, TestEvent::A);
    run_loop.add_timer_at(deadline, TestEvent::C);

    let mut fired = Vec::new();
    run_loop.process_timers(deadline, |_, _, event| fired.push(event));
    assert_eq!(fired, vec![TestEvent::B, TestEvent::A, TestEvent::C]);
}

#[test]
fn test_remove_timer() {
    let mut run_loop = RunLoop::new();
    let start = Instant::now();

    let a = run_loop.add_timer_at(start, TestEvent::A);
    let b = run_loop.add_timer_at(start, TestEvent::B);

    assert!(run_loop.remove_timer(a));
    assert!(!run_loop.contains(a));
    // Second removal is a no-op
    assert!(!run_loop.remove_timer(a));

    let mut fired = Vec::new();
    run_loop.process_timers(start, |_, _, event| fired.push(event));
    assert_eq!(fired, vec![TestEvent::B]);

    // Removing a timer that already fired is a no-op too
    assert!(!run_loop.remove_timer(b));
    assert!(run_loop.is_empty());
}

#[test]
fn test_handler_can_cancel_pending_timer() {
    let mut run_loop = RunLoop::new();
    let start = Instant::now();

    run_loop.add_timer_at(start, TestEvent::A);
    let b = run_loop.add_timer_at(start, TestEvent::B);

    let mut fired = Vec::new();
    run_loop.process_timers(start, |run_loop, _, event| {
        if event == TestEvent::A {
            run_loop.remove_timer(b);
        }
        fired.push(event);
    });
    assert_eq!(fired, vec![TestEvent::A]);
}

#[test]
fn test_rearmed_timer_fires_next_iteration() {
    let mut run_loop = RunLoop::new();
    let start = Instant::now();

    run_loop.add_timer_at(start, TestEvent::Heartbeat);

    let mut beats = 0;
    for iteration in 1..=3u64 {
        // Even an already-expired re-arm waits for the next call
        let fired = run_loop.process_timers(start + Duration::from_millis(iteration), |run_loop, _, event| {
            assert_eq!(event, TestEvent::Heartbeat);
            beats += 1;
            run_loop.add_timer_at(start, TestEvent::Heartbeat);
        });
        assert_eq!(fired, 1);
    }

    assert_eq!(beats, 3);
    assert_eq!(run_loop.len(), 1);
}

#[test]
fn test_timeout_at() {
    let mut run_loop: RunLoop<TestEvent> = RunLoop::new();
    let start = Instant::now();
    assert_eq!(run_loop.timeout_at(start), None);

    run_loop.add_timer_at(start + Duration::from_millis(50), TestEvent::A);
    assert_eq!(run_loop.timeout_at(start), Some(Duration::from_millis(50)));
    // An overdue deadline does not block at all
    assert_eq!(run_loop.timeout_at(start + Duration::from_secs(1)), Some(Duration::ZERO));
}

#[test]
fn test_run_once_services_io_then_timers() {
    let mut run_loop = RunLoop::new();
    let mut source = MockSource {
        ready: VecDeque::from(vec![true, false]),
        timeouts: Vec::new(),
    };

    run_loop.add_timer(Duration::ZERO, TestEvent::A);
    let later = run_loop.add_timer(Duration::from_secs(60), TestEvent::B);

    let mut log = Vec::new();
    let fired = run_loop
        .run_once(
            &mut source,
            |_, _| log.push("io"),
            |_, _, event| {
                assert_eq!(event, TestEvent::A);
            },
        )
        .unwrap();
    assert_eq!(fired, 1);
    assert_eq!(log, vec!["io"]);
    assert_eq!(source.timeouts.len(), 1);
    assert!(source.timeouts[0].is_some());

    // Only the 60 second timer is left, so the wait is bounded by it
    assert!(run_loop.contains(later));
    run_loop.run_once(&mut source, |_, _| panic!("not ready"), |_, _, _| {}).unwrap();
    let timeout = source.timeouts[1].unwrap();
    assert!(timeout > Duration::from_secs(50));

    run_loop.remove_timer(later);
    run_loop.run_once(&mut source, |_, _| {}, |_, _, _| {}).unwrap();
    assert_eq!(source.timeouts[2], None);
}
