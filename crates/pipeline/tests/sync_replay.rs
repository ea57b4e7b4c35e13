//! Integration coverage for sync (replay) mode: a log durably written by a
//! normal `Stream::start` run is later replayed end-to-end through
//! `Stream::replay`, exercising the Reader -> Handler -> Sender wiring
//! against a fresh set of collaborators.

mod common;

use std::sync::Arc;

use runlog_core::settings::Settings;
use runlog_pipeline::{
  collab::fake::FakeCollaborators,
  reader::RunIdentityOverlay,
  stream::Stream,
};
use runlog_proto::{Control, ExitRecord, PartialHistoryAction, PartialHistoryRecord, Record, RecordKind, Value};

#[tokio::test(flavor = "multi_thread")]
async fn a_run_written_live_replays_cleanly_through_sync_mode() {
  let dir = tempfile::tempdir().unwrap();
  let log_path = dir.path().join("run.bin");

  // Write a small run through the normal (durable) wiring first.
  let live_fake = Arc::new(FakeCollaborators::default());
  let settings = Arc::new(Settings::default());
  let live = Stream::start(settings.clone(), "client-1", &log_path, common::collaborators(live_fake.clone())).unwrap();

  let control = Control { connection_id: Some("conn-1".into()), req_resp: true, ..Default::default() };
  live
    .handle_record(Record::new(RecordKind::Run(common::run_record())).with_control(control.clone()))
    .await
    .unwrap();
  live
    .handle_record(Record::new(RecordKind::PartialHistory(PartialHistoryRecord {
      items: vec![(vec!["loss".into()], Value::Float(0.5))],
      step: Some(0),
      action: PartialHistoryAction::Flush,
    })))
    .await
    .unwrap();
  live.handle_record(Record::new(RecordKind::Exit(ExitRecord { exit_code: 0 })).with_control(control)).await.unwrap();
  live.finish_and_close(Some(0)).await;

  assert_eq!(live_fake.state.lock().unwrap().upserts.len(), 1);

  // Now replay the same log from scratch against a different identity and a
  // fresh set of collaborators.
  let replay_fake = Arc::new(FakeCollaborators::default());
  let overlay = RunIdentityOverlay {
    entity: "replay-entity".into(),
    project: "replay-project".into(),
    run_id: "replay-run".into(),
  };
  let replay = Stream::replay(settings, "client-1", &log_path, overlay, common::collaborators(replay_fake.clone())).unwrap();
  replay.close().await;

  let state = replay_fake.state.lock().unwrap();
  assert_eq!(state.upserts.len(), 1);
  assert_eq!(state.upserts[0].entity, "replay-entity");
  assert_eq!(state.upserts[0].project, "replay-project");
  assert_eq!(state.upserts[0].run_id, "replay-run");
  assert_eq!(state.finished_with_exit, Some(0));
  assert!(state.stream_updates.iter().any(|u| matches!(
    u,
    runlog_pipeline::collab::FileStreamUpdate::History(json) if json.get("step") == Some(&serde_json::json!(0))
  )));
}
