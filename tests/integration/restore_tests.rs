//! Identifier registry: binding, restore across reconnects, forgetting.

use wearevent::{
    Comparison, DataKind, DeviceCommand, Error, FilterSpec, Inbound, Register, RegisterAddr,
    RegistrySnapshot, SessionConfig, SourceRef, TransportError, Value,
};

use crate::mock_board::{BUTTON, Recorder, TEMPERATURE, button, connected, ok, reconnect};

type Answer = wearevent::Result<bool>;

#[test]
fn restore_after_reconnect_rebuilds_same_recipe() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    let recipe = dev.recipe(&presses)?.expect("derived events have a recipe");

    reconnect(&mut dev);
    let restored = dev.restore("presses")?.expect("identifier is bound");

    assert_ne!(restored, presses);
    assert_eq!(dev.recipe(&restored)?, Some(recipe));
    assert_eq!(restored.addr(), presses.addr());
    // Restoring is lazy; nothing reaches the board yet.
    assert!(dev.transport().commands().is_empty());
    Ok(())
}

#[test]
fn duplicate_identifier_keeps_first_binding() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let first = dev.derive_accumulate_as(&button, "count")?;

    let second = dev.derive_periodic_sample_as(&button, 250, "count");
    assert_eq!(second, Err(Error::DuplicateIdentifier("count".into())));

    let restored = dev.restore("count")?.expect("still bound");
    assert_eq!(restored, first);
    let recipe = dev.recipe(&restored)?.expect("recipe");
    assert_eq!(recipe.filter, FilterSpec::Accumulate);
    Ok(())
}

#[test]
fn empty_identifier_rejected() {
    let mut dev = connected();
    let button = button(&mut dev);
    assert!(matches!(
        dev.derive_accumulate_as(&button, ""),
        Err(Error::InvalidArgument(_))
    ));
    assert!(dev.identifiers().is_empty());
}

#[test]
fn stale_events_are_invalidated() {
    let mut dev = connected();
    let button = button(&mut dev);
    reconnect(&mut dev);

    assert_eq!(
        dev.start_notifications(&button, |_| {}),
        Err(Error::InvalidatedSession)
    );
    assert_eq!(dev.start_logging(&button), Err(Error::InvalidatedSession));
    assert_eq!(
        dev.derive_accumulate(&button),
        Err(Error::InvalidatedSession)
    );
    assert_eq!(dev.recipe(&button), Err(Error::InvalidatedSession));
}

#[test]
fn chain_through_identified_source_is_restored() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    let sampled = dev.derive_periodic_sample_as(&presses, 500, "sampled")?;
    assert_eq!(
        dev.recipe(&sampled)?.map(|r| r.source),
        Some(SourceRef::Identifier("presses".into()))
    );
    let sampled_addr = sampled.addr();
    let presses_addr = presses.addr();
    drop((sampled, presses));

    reconnect(&mut dev);
    let sampled = dev.restore("sampled")?.expect("bound");
    assert_eq!(sampled.addr(), sampled_addr);

    // Its identified source was rebuilt along the way and is found live.
    let presses = dev.restore("presses")?.expect("bound");
    assert_eq!(presses.addr(), presses_addr);
    assert_eq!(
        dev.recipe(&presses)?.map(|r| r.source),
        Some(SourceRef::Root {
            addr: BUTTON,
            kind: DataKind::Bool
        })
    );
    Ok(())
}

#[test]
fn anonymous_intermediate_is_rebuilt_inline() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let _many =
        dev.derive_compare_as(&presses, Comparison::GreaterThan, Value::Int(3), "many")?;

    reconnect(&mut dev);
    let many = dev.restore("many")?.expect("bound");
    let recipe = dev.recipe(&many)?.expect("recipe");
    assert!(matches!(
        &recipe.source,
        SourceRef::Filter(inner) if inner.filter == FilterSpec::Accumulate
    ));
    assert_eq!(recipe.inline_depth(), 2);
    Ok(())
}

#[test]
fn live_identifier_returns_existing_event() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    let again = dev.restore("presses")?.expect("bound");
    assert_eq!(again, presses);
    Ok(())
}

#[test]
fn unknown_identifier_is_none() -> anyhow::Result<()> {
    let mut dev = connected();
    assert!(dev.restore("nothing-here")?.is_none());
    Ok(())
}

#[test]
fn restore_needs_a_connection() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    dev.derive_accumulate_as(&button, "presses")?;
    dev.handle(Inbound::Disconnected);

    assert_eq!(
        dev.restore("presses"),
        Err(Error::Transport(TransportError::NotConnected))
    );
    Ok(())
}

#[test]
fn forgotten_identifier_breaks_dependants() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    dev.derive_periodic_sample_as(&presses, 500, "sampled")?;
    reconnect(&mut dev);

    assert!(dev.forget("presses"));
    assert!(!dev.forget("presses"));
    assert!(dev.restore("presses")?.is_none());
    assert_eq!(
        dev.restore("sampled"),
        Err(Error::UnknownIdentifier("presses".into()))
    );
    assert_eq!(dev.identifiers(), vec!["sampled".to_owned()]);
    Ok(())
}

#[test]
fn forgotten_live_event_keeps_working() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    dev.forget("presses");

    assert!(dev.restore("presses")?.is_none());
    dev.start_logging(&presses)?;
    // The name is free again.
    dev.derive_accumulate_as(&button, "presses")?;
    Ok(())
}

#[test]
fn snapshot_lists_every_binding() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let temperature = dev.data(TEMPERATURE, DataKind::I16)?;
    dev.derive_read_coupled_as(&button, &temperature, "warm-press")?;
    dev.derive_accumulate_as(&button, "presses")?;

    assert_eq!(
        dev.identifiers(),
        vec!["presses".to_owned(), "warm-press".to_owned()]
    );

    let snapshot = dev.registry_snapshot()?;
    let json = snapshot.to_json()?;
    assert!(json.contains("warm-press"));
    assert_eq!(RegistrySnapshot::from_json(&json)?, snapshot);
    assert_eq!(
        snapshot.entries["warm-press"].filter,
        FilterSpec::ReadCoupled {
            data: TEMPERATURE,
            kind: DataKind::I16
        }
    );
    Ok(())
}

#[test]
fn board_held_filter_is_restored_at_its_slot() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let _sampled = dev.derive_periodic_sample(&button, 100)?;
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    let slot = presses.addr();
    dev.start_logging(&presses)?;
    drop(presses);

    reconnect(&mut dev);
    dev.transport_mut().clear();
    let button = dev.event(BUTTON, DataKind::Bool)?;
    // Fresh filters stay clear of the slot the board still uses.
    let fresh = dev.derive_accumulate(&button)?;
    assert_ne!(fresh.addr(), slot);

    let presses = dev.restore("presses")?.expect("bound");
    assert_eq!(presses.addr(), slot);
    assert!(dev.transport().commands().is_empty());

    // Whether the board is still logging is only known after asking.
    let answers = Recorder::<Answer>::new();
    dev.is_logging(&presses, answers.sink())?;
    assert_eq!(answers.len(), 0);
    let query = dev
        .transport()
        .request_of(|c| matches!(c, DeviceCommand::QueryLogging { source } if *source == slot))
        .expect("logging state queried");
    dev.handle(ok(query, &[1]));
    assert_eq!(answers.take(), vec![Ok(true)]);

    dev.download_log(&presses, false, |_| {}, None)?;
    assert_eq!(
        dev.transport().commands(),
        vec![
            DeviceCommand::QueryLogging { source: slot },
            DeviceCommand::DownloadLog {
                source: slot,
                chunk_entries: SessionConfig::default().download_chunk_entries,
            },
        ]
    );
    Ok(())
}

#[test]
fn removed_filter_is_created_again_after_restore() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    dev.start_logging(&presses)?;
    drop(presses);
    // Deriving prunes the dropped filter and removes it from the board.
    let _sampled = dev.derive_periodic_sample(&button, 100)?;
    assert!(
        dev.transport()
            .commands()
            .iter()
            .any(|c| matches!(c, DeviceCommand::RemoveFilter { .. }))
    );

    reconnect(&mut dev);
    dev.transport_mut().clear();
    let presses = dev.restore("presses")?.expect("bound");
    let answers = Recorder::<Answer>::new();
    dev.is_logging(&presses, answers.sink())?;
    assert_eq!(answers.take(), vec![Ok(false)]);

    dev.start_logging(&presses)?;
    let commands = dev.transport().commands();
    assert!(matches!(
        commands[0],
        DeviceCommand::CreateFilter { output, .. } if output == presses.addr()
    ));
    assert_eq!(
        commands[1],
        DeviceCommand::StartLogging {
            source: presses.addr()
        }
    );
    Ok(())
}

#[test]
fn never_materialised_binding_reserves_nothing() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate_as(&button, "presses")?;
    let slot = presses.addr();
    drop(presses);

    reconnect(&mut dev);
    let button = dev.event(BUTTON, DataKind::Bool)?;
    let fresh = dev.derive_accumulate(&button)?;
    assert_eq!(fresh.addr(), slot);

    // Its slot is taken, so the restored filter goes elsewhere.
    let presses = dev.restore("presses")?.expect("bound");
    assert_ne!(presses.addr(), slot);
    dev.start_logging(&presses)?;
    assert!(matches!(
        dev.transport().commands().last(),
        Some(DeviceCommand::StartLogging { .. })
    ));
    let created = dev.transport().request_of(|c| {
        matches!(c, DeviceCommand::CreateFilter { output, .. } if *output == presses.addr())
    });
    assert!(created.is_some());
    Ok(())
}

#[test]
fn live_anonymous_intermediate_is_shared() -> anyhow::Result<()> {
    let mut dev = connected();
    let button = button(&mut dev);
    let presses = dev.derive_accumulate(&button)?;
    let many = dev.derive_compare_as(&presses, Comparison::GreaterThan, Value::Int(3), "many")?;
    let many_addr = many.addr();
    drop(many);
    // Looking up a root prunes the dropped event.
    dev.event(BUTTON, DataKind::Bool)?;

    let many = dev.restore("many")?.expect("bound");
    assert_eq!(many.addr(), many_addr);
    assert_eq!(
        dev.recipe(&many)?.map(|r| r.source),
        dev.recipe(&presses)?.map(|r| SourceRef::Filter(Box::new(r)))
    );
    // No second accumulator was built, so the next slot is still free.
    let next = dev.derive_accumulate(&button)?;
    assert_eq!(next.addr(), RegisterAddr::filter_output(2));
    Ok(())
}
