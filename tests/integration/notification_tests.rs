//! Notification subscriptions and host-side propagation.

use wearevent::link::post;
use wearevent::{
    Comparison, DataKind, DeviceCommand, Error, Inbound, Inbox, Register, SessionConfig,
    TransportError, Value,
};

use crate::mock_board::{
    BUTTON, Recorder, Sent, TAP, TEMPERATURE, button, connected, connected_with, notify, ok,
};

type Delivery = wearevent::Result<Value>;

// ── Roots ─────────────────────────────────────────────────────

#[test]
fn root_firings_reach_handler_in_order() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&button, seen.sink())?;
    assert_eq!(dev.transport().sent, vec![Sent::Subscribe(BUTTON)]);

    dev.handle(notify(BUTTON, 0, &[1]));
    dev.handle(notify(BUTTON, 5, &[0]));

    assert_eq!(seen.take(), vec![Ok(Value::Bool(true)), Ok(Value::Bool(false))]);
    assert_eq!(dev.cached_value(&button)?, Some(Value::Bool(false)));
    Ok(())
}

#[test]
fn root_events_are_memoised() -> anyhow::Result<()> {
    let mut dev = connected();
    let a = button(&mut dev);
    let b = button(&mut dev);
    assert_eq!(a, b);
    assert!(matches!(
        dev.event(BUTTON, DataKind::U8),
        Err(Error::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn stop_without_handler_is_noop() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    dev.stop_notifications(&button)?;
    dev.stop_notifications(&button)?;
    assert!(dev.transport().sent.is_empty());
    Ok(())
}

#[test]
fn new_handler_replaces_old_one() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let first = Recorder::<Delivery>::new();
    let second = Recorder::<Delivery>::new();
    dev.start_notifications(&button, first.sink())?;
    dev.start_notifications(&button, second.sink())?;

    dev.handle(notify(BUTTON, 0, &[1]));

    assert_eq!(first.len(), 0);
    assert_eq!(second.take(), vec![Ok(Value::Bool(true))]);
    assert_eq!(dev.transport().count(|s| matches!(s, Sent::Subscribe(_))), 1);
    Ok(())
}

#[test]
fn refused_subscribe_is_retried_by_next_subscriber() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let first = Recorder::<Delivery>::new();
    let second = Recorder::<Delivery>::new();

    dev.transport_mut().fail_with = Some(TransportError::Timeout);
    dev.start_notifications(&button, first.sink())?;
    assert_eq!(
        first.take(),
        vec![Err(Error::Transport(TransportError::Timeout))]
    );
    assert!(dev.transport().sent.is_empty());

    dev.transport_mut().fail_with = None;
    dev.start_notifications(&presses, second.sink())?;
    assert_eq!(dev.transport().sent, vec![Sent::Subscribe(BUTTON)]);

    dev.handle(notify(BUTTON, 0, &[1]));
    assert_eq!(first.take(), vec![Ok(Value::Bool(true))]);
    assert_eq!(second.take(), vec![Ok(Value::Int(1))]);

    dev.stop_notifications(&button)?;
    dev.stop_notifications(&presses)?;
    assert_eq!(dev.transport().count(|s| matches!(s, Sent::Unsubscribe(_))), 1);
    Ok(())
}

// ── Derived events ────────────────────────────────────────────

#[test]
fn firing_visits_node_before_children() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let many = dev.derive_compare(&presses, Comparison::GreaterThanOrEqual, Value::Int(2))?;

    let log = Recorder::<(&'static str, Delivery)>::new();
    let mut a = log.sink();
    dev.start_notifications(&button, move |r| a(("button", r)))?;
    let mut b = log.sink();
    dev.start_notifications(&presses, move |r| b(("presses", r)))?;
    let mut c = log.sink();
    dev.start_notifications(&many, move |r| c(("many", r)))?;

    dev.handle(notify(BUTTON, 0, &[1]));
    dev.handle(notify(BUTTON, 1, &[1]));

    assert_eq!(
        log.take(),
        vec![
            ("button", Ok(Value::Bool(true))),
            ("presses", Ok(Value::Int(1))),
            ("button", Ok(Value::Bool(true))),
            ("presses", Ok(Value::Int(2))),
            ("many", Ok(Value::Int(2))),
        ]
    );
    // One stream serves the whole tree.
    assert_eq!(dev.transport().count(|s| matches!(s, Sent::Subscribe(_))), 1);
    Ok(())
}

#[test]
fn stream_closes_with_last_subscriber() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let r = Recorder::<Delivery>::new();
    dev.start_notifications(&button, r.sink())?;
    dev.start_notifications(&presses, r.sink())?;

    dev.stop_notifications(&presses)?;
    assert_eq!(dev.transport().count(|s| matches!(s, Sent::Unsubscribe(_))), 0);
    dev.stop_notifications(&button)?;
    assert_eq!(
        dev.transport().sent.last(),
        Some(&Sent::Unsubscribe(BUTTON))
    );
    Ok(())
}

#[test]
fn periodic_sample_fires_on_leading_edge() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let sampled = dev.derive_periodic_sample(&button, 100)?;
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&sampled, seen.sink())?;

    for t in [0, 30, 60, 90, 150, 200] {
        dev.handle(notify(BUTTON, t, &[1]));
    }

    assert_eq!(seen.len(), 2);
    assert_eq!(sampled.kind(), DataKind::Bool);
    Ok(())
}

#[test]
fn zero_period_rejected() {
    let mut dev = connected();
    let button = button(&mut dev);
    assert!(matches!(
        dev.derive_periodic_sample(&button, 0),
        Err(Error::InvalidArgument(_))
    ));
}

// ── Errors ────────────────────────────────────────────────────

#[test]
fn stream_error_reaches_subtree_and_keeps_subscription() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&presses, seen.sink())?;

    dev.handle(Inbound::StreamError {
        source: BUTTON,
        error: TransportError::Timeout,
    });
    dev.handle(notify(BUTTON, 0, &[1]));

    assert_eq!(
        seen.take(),
        vec![
            Err(Error::Transport(TransportError::Timeout)),
            Ok(Value::Int(1)),
        ]
    );
    Ok(())
}

#[test]
fn undecodable_payload_is_reported() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&button, seen.sink())?;

    dev.handle(notify(BUTTON, 0, &[1, 2]));

    let got = seen.take();
    assert_eq!(got.len(), 1);
    assert!(matches!(got[0], Err(Error::Decode(_))));
    Ok(())
}

#[test]
fn disconnect_drops_handlers_silently() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&button, seen.sink())?;

    dev.handle(Inbound::Disconnected);
    dev.handle(notify(BUTTON, 0, &[1]));

    assert_eq!(seen.len(), 0);
    assert!(!dev.is_connected());
    Ok(())
}

// ── Read-coupled ──────────────────────────────────────────────

#[test]
fn read_coupled_reads_only_for_subscribers() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let temperature = dev.data(TEMPERATURE, DataKind::I16)?;
    let reading = dev.derive_read_coupled(&button, &temperature)?;
    assert_eq!(reading.kind(), DataKind::I16);

    dev.handle(notify(BUTTON, 0, &[1]));
    assert_eq!(dev.transport().read_request(TEMPERATURE), None);

    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&reading, seen.sink())?;
    dev.handle(notify(BUTTON, 10, &[1]));
    let request = dev.transport().read_request(TEMPERATURE).expect("read issued");
    assert_eq!(seen.len(), 0);

    dev.handle(ok(request, &(-40i16).to_le_bytes()));
    assert_eq!(seen.take(), vec![Ok(Value::Int(-40))]);
    assert_eq!(dev.cached_value(&temperature)?, Some(Value::Int(-40)));
    Ok(())
}

#[test]
fn read_coupled_resumes_downstream_branch() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let temperature = dev.data(TEMPERATURE, DataKind::I16)?;
    let reading = dev.derive_read_coupled(&button, &temperature)?;
    let total = dev.derive_accumulate(&reading)?;
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&total, seen.sink())?;

    for (t, temp) in [(0u64, 5i16), (10, 7)] {
        dev.handle(notify(BUTTON, t, &[1]));
        let request = dev.transport().read_request(TEMPERATURE).expect("read issued");
        dev.handle(ok(request, &temp.to_le_bytes()));
    }

    assert_eq!(seen.take(), vec![Ok(Value::Int(5)), Ok(Value::Int(12))]);
    Ok(())
}

#[test]
fn failed_coupled_read_reports_error() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let temperature = dev.data(TEMPERATURE, DataKind::I16)?;
    let reading = dev.derive_read_coupled(&button, &temperature)?;
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&reading, seen.sink())?;

    dev.handle(notify(BUTTON, 0, &[1]));
    let request = dev.transport().read_request(TEMPERATURE).expect("read issued");
    dev.handle(Inbound::Response {
        request,
        result: Err(TransportError::Rejected(2)),
    });

    assert_eq!(
        seen.take(),
        vec![Err(Error::Transport(TransportError::Rejected(2)))]
    );
    Ok(())
}

#[test]
fn read_coupled_rejects_foreign_data() -> anyhow::Result<()> {
    let mut dev = connected();
    let mut other = connected();
    let button = button(&mut dev);
    let temperature = other.data(TEMPERATURE, DataKind::I16)?;
    assert_eq!(
        dev.derive_read_coupled(&button, &temperature),
        Err(Error::CrossSession)
    );
    Ok(())
}

// ── Lifecycle of derived events ───────────────────────────────

#[test]
fn dropped_materialised_filter_is_removed() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let scratch = dev.derive_accumulate(&button)?;
    dev.start_logging(&presses)?;
    let output = presses.addr();
    drop(presses);
    drop(scratch);

    dev.handle(notify(BUTTON, 0, &[1]));

    let removed: Vec<_> = dev
        .transport()
        .commands()
        .into_iter()
        .filter(|c| matches!(c, DeviceCommand::RemoveFilter { .. }))
        .collect();
    assert_eq!(removed, vec![DeviceCommand::RemoveFilter { output }]);
    Ok(())
}

#[test]
fn dropped_subscribed_event_closes_stream() -> anyhow::Result<()> {
    let mut dev = connected();
    let tap = dev.event(TAP, DataKind::U8)?;
    let taps = dev.derive_accumulate(&tap)?;
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&taps, seen.sink())?;
    drop(taps);

    dev.handle(notify(TAP, 0, &[1]));

    assert_eq!(seen.len(), 0);
    assert_eq!(dev.transport().sent.last(), Some(&Sent::Unsubscribe(TAP)));
    Ok(())
}

#[test]
fn filter_capacity_is_bounded() -> anyhow::Result<()> {
    let mut dev = connected_with(SessionConfig {
        max_filters: 2,
        ..SessionConfig::default()
    });
    let button = button(&mut dev);
    let a = dev.derive_accumulate(&button)?;
    let _b = dev.derive_accumulate(&button)?;
    assert!(matches!(
        dev.derive_accumulate(&button),
        Err(Error::ResourceExhausted(_))
    ));

    let freed = a.addr();
    drop(a);
    let c = dev.derive_accumulate(&button)?;
    assert_eq!(c.addr(), freed);
    Ok(())
}

// ── Inbox ─────────────────────────────────────────────────────

#[test]
fn queued_traffic_is_drained() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let seen = Recorder::<Delivery>::new();
    dev.start_notifications(&button, seen.sink())?;

    let inbox = Inbox::new();
    assert!(post(&inbox, notify(BUTTON, 0, &[1])));
    assert!(post(&inbox, notify(BUTTON, 1, &[0])));
    assert_eq!(dev.drain(&inbox), 2);
    assert_eq!(seen.len(), 2);

    post(&inbox, notify(BUTTON, 2, &[1]));
    futures_lite::future::block_on(dev.next_inbound(&inbox));
    assert_eq!(seen.len(), 3);
    Ok(())
}
