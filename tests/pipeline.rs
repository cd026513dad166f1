// End-to-end: replay file -> config -> poller -> engine -> discovery events

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Span;
use tunetrail::config::{Config, SourceConfig, StrategyKind};
use tunetrail::sources::ReplaySource;
use tunetrail::{
    DiscoveryEngine, EventBus, PlatformId, Play, Poller, ReportedStatus, Snapshot, SnapshotSource, SourceEvent,
};

fn playing(platform: &PlatformId, play: &Play, at: DateTime<Utc>) -> Snapshot {
    Snapshot::new(platform.clone())
        .with_play(play.clone())
        .with_status(ReportedStatus::Playing)
        .at(at)
}

fn discovered(rx: &mut broadcast::Receiver<SourceEvent>) -> Vec<Play> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|event| match event {
            SourceEvent::Discovered { plays, .. } => Some(plays),
            _ => None,
        })
        .flatten()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn replay_file_through_poller() {
    let now = Utc::now();
    let desk = PlatformId::new("desk", "alice");
    let one = Play::new("Around the World", vec!["Daft Punk".into()]).with_duration(40.0);
    let two = Play::new("Da Funk", vec!["Daft Punk".into()]).with_duration(300.0);
    let mut old = Play::new("Revolution 909", vec!["Daft Punk".into()])
        .with_play_date(now - ChronoDuration::hours(3))
        .with_listened_for(330.0);
    old.set_platform(&desk);

    let batches = vec![
        vec![
            playing(&desk, &one, now - ChronoDuration::seconds(40)),
            playing(&desk, &one, now - ChronoDuration::seconds(20)),
        ],
        vec![
            playing(&desk, &one, now - ChronoDuration::seconds(10)),
            playing(&desk, &two, now - ChronoDuration::seconds(5)),
        ],
    ];

    let dir = tempfile::tempdir().unwrap();
    let replay_path = dir.path().join("desk.json");
    let payload = serde_json::json!({ "batches": batches, "backlog": [old] });
    std::fs::write(&replay_path, serde_json::to_string_pretty(&payload).unwrap()).unwrap();

    let config_path = dir.path().join("config.toml");
    let mut config = Config::default();
    config.sources.push(SourceConfig::replay("desk-replay", &replay_path));
    config.save_to(&config_path).unwrap();
    let config = Config::load_from(&config_path).unwrap();
    let source_config = &config.sources[0];

    let source = Arc::new(ReplaySource::open(source_config.name.clone(), &source_config.path).unwrap());
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let engine = DiscoveryEngine::new(source.identity(), config.discovery_options(source_config), bus, Span::none());
    let poller = Poller::new(source.clone(), engine, config.polling_options(source_config), Span::none());

    poller.start_polling();
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(poller.stop_polling(true).await);
    assert_eq!(source.remaining(), 0);

    let plays = discovered(&mut rx);
    let names: Vec<&str> = plays.iter().map(|p| p.data.track.as_str()).collect();
    assert_eq!(names, vec!["Revolution 909", "Around the World"]);

    let live = &plays[1];
    assert_eq!(live.meta.source, "desk-replay");
    assert_eq!(live.data.listened_for, Some(30.0));
    assert_eq!(live.platform_id(), desk);

    let engine = poller.engine();
    let engine = engine.lock().await;
    assert_eq!(engine.discovered_count(), 2);
    assert_eq!(engine.recently_discovered(&desk).len(), 2);
    let players = engine.player_snapshots();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].track.as_deref(), Some("Da Funk"));
}

#[test]
fn repeated_track_becomes_two_plays() {
    let mut config = Config::default();
    config.player.strategy = StrategyKind::HighDrift;
    let source_config = SourceConfig::replay("car", "unused.json");

    let bus = EventBus::default();
    let mut engine = DiscoveryEngine::new(
        tunetrail::SourceIdentity::new("car", "replay"),
        config.discovery_options(&source_config),
        bus,
        Span::none(),
    );

    let start = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
    let at = |secs: i64| start + ChronoDuration::seconds(secs);
    let car = PlatformId::new("car", "dan");
    let song = Play::new("Get Lucky", vec!["Daft Punk".into(), "Pharrell Williams".into()]).with_duration(100.0);
    let next = Play::new("Lose Yourself to Dance", vec!["Daft Punk".into()]).with_duration(350.0);

    let mut batch = Vec::new();
    // first listen 0 -> 90, then straight back to the top and again
    for step in 0..=9 {
        batch.push(playing(&car, &song, at(step * 10)).with_position((step * 10) as f64));
    }
    for step in 0..=9 {
        batch.push(playing(&car, &song, at(100 + step * 10)).with_position((3 + step * 10) as f64));
    }
    batch.push(playing(&car, &next, at(200)).with_position(0.0));

    let found = engine.process_recent_plays_at(batch.clone(), at(200));
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].data.play_date, Some(at(0)));
    assert_eq!(found[1].data.play_date, Some(at(100)));
    assert_eq!(found[0].data.listened_for, Some(90.0));
    assert_eq!(found[1].data.listened_for, Some(90.0));
    assert_ne!(found[0].meta.occurrence, found[1].meta.occurrence);

    // seeing the same history again changes nothing
    assert!(engine.process_recent_plays_at(batch, at(201)).is_empty());
    assert_eq!(engine.discovered_count(), 2);
}
