//! Recording session manager – drives `Idle → Recording → Idle` from the
//! recorder control channel and persists the captured session.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rewind_common::images::{self, AssetFetcher};
use rewind_common::naming;
use rewind_common::protocol::RecorderCommand;
use rewind_common::recording::EventKind;

use crate::sessions::Sessions;
use crate::store::Store;

#[derive(Clone)]
pub struct Recorder {
    sessions: Arc<Sessions>,
    store: Store,
    fetcher: Arc<dyn AssetFetcher>,
    /// Save count per session name.  Held across every write of an
    /// artifact so a post-process only writes over the save it started
    /// from.
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

/// A recording that was written to storage.
#[derive(Debug)]
pub struct Saved {
    pub name: String,
    /// `true` when an earlier recording with the same name was replaced.
    pub updated: bool,
    /// Background image post-processing; resolves to the number of images
    /// embedded.
    #[allow(dead_code)]
    pub post_process: JoinHandle<Result<usize>>,
}

/// What a control message did.
#[derive(Debug)]
pub enum Handled {
    Started,
    Ingested(EventKind),
    Stopped(Saved),
    /// Out-of-state command or unrecognised event shape.
    Ignored,
}

impl Recorder {
    pub fn new(sessions: Arc<Sessions>, store: Store, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Recorder {
            sessions,
            store,
            fetcher,
            generations: Arc::default(),
        }
    }

    /// Handle one text frame from the recorder channel.
    pub async fn handle(&self, text: &str) -> Result<Handled> {
        let handled = match RecorderCommand::parse(text)? {
            RecorderCommand::Start { initial_state } => {
                if self.start(initial_state) {
                    Handled::Started
                } else {
                    Handled::Ignored
                }
            }
            RecorderCommand::Stop { name, impurities } => {
                match self.stop(name.as_deref(), impurities).await? {
                    Some(saved) => Handled::Stopped(saved),
                    None => Handled::Ignored,
                }
            }
            RecorderCommand::Event(event) => match self.ingest(event) {
                Some(kind) => Handled::Ingested(kind),
                None => Handled::Ignored,
            },
        };
        Ok(handled)
    }

    pub fn start(&self, initial_state: Value) -> bool {
        if !self.sessions.start_recording(initial_state) {
            warn!("Start recording ignored – a recording or replay is already active");
            return false;
        }
        info!("Started recording");
        true
    }

    pub fn ingest(&self, event: Value) -> Option<EventKind> {
        let kind = self.sessions.ingest(event);
        if kind.is_none() {
            debug!("Dropped event (not recording or unrecognised shape)");
        }
        kind
    }

    /// Stop the active recording and persist it under `name`.
    ///
    /// The artifact is written first; images are embedded afterwards by a
    /// background task that rewrites it once every fetch has completed.
    /// If the save fails the accumulator is put back so the session can be
    /// stopped again.
    pub async fn stop(&self, name: Option<&str>, impurities: Value) -> Result<Option<Saved>> {
        let Some(mut recording) = self.sessions.take_recording() else {
            warn!("Stop recording ignored – not recording");
            return Ok(None);
        };
        recording.impurities = impurities;

        let name = naming::session_name(name);
        let (outcome, generation) = {
            let mut generations = self.generations.lock().await;
            match self.store.save(&name, &recording).await {
                Ok(outcome) => {
                    let generation = generations.entry(name.clone()).or_default();
                    *generation += 1;
                    (outcome, *generation)
                }
                Err(e) => {
                    error!(
                        "Saving {name} failed, still recording ({} dispatches, {} key presses, {} API responses)",
                        recording.dispatches.len(),
                        recording.key_presses.len(),
                        recording.xhr_responses.len()
                    );
                    if !self.sessions.resume_recording(recording) {
                        error!("Cannot resume recording {name} – capture discarded");
                    }
                    return Err(e);
                }
            }
        };
        let updated = if outcome.updated { "updated " } else { "" };
        info!("Stopped recording, saved {updated}{name}");

        let post_process = tokio::spawn(post_process(self.clone(), name.clone(), generation));

        Ok(Some(Saved {
            name,
            updated: outcome.updated,
            post_process,
        }))
    }

    /// Embed the images referenced by a stored recording and rewrite it,
    /// unless `name` was saved again in the meantime.
    async fn embed_images(&self, name: &str, generation: u64) -> Result<usize> {
        let mut recording = self.store.load(name).await?;
        let fetched = images::externalize(&mut recording, self.fetcher.as_ref()).await?;
        if fetched == 0 {
            return Ok(0);
        }

        let generations = self.generations.lock().await;
        if generations.get(name) != Some(&generation) {
            debug!("Recording {name} was saved again – dropping its earlier images");
            return Ok(0);
        }
        self.store.write(name, &recording).await?;
        Ok(fetched)
    }
}

async fn post_process(recorder: Recorder, name: String, generation: u64) -> Result<usize> {
    let result = recorder.embed_images(&name, generation).await;
    match &result {
        Ok(0) => debug!("No images embedded in {name}"),
        Ok(count) => info!("Added {count} base64 image(s) to recording {name}"),
        Err(e) => error!("Image post-processing failed for {name}: {e:#}"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::recording::ImageData;
    use serde_json::json;

    struct StubFetcher;

    #[async_trait::async_trait]
    impl AssetFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            if url.contains("missing") {
                anyhow::bail!("404 for {url}");
            }
            Ok(b"img".to_vec())
        }
    }

    /// Like [`StubFetcher`] but each fetch takes a while.
    struct SlowFetcher;

    #[async_trait::async_trait]
    impl AssetFetcher for SlowFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            Ok(b"old".to_vec())
        }
    }

    fn recorder(root: &std::path::Path) -> (Recorder, Arc<Sessions>, Store) {
        let sessions = Arc::new(Sessions::new());
        let store = Store::new(root);
        let recorder = Recorder::new(sessions.clone(), store.clone(), Arc::new(StubFetcher));
        (recorder, sessions, store)
    }

    #[tokio::test]
    async fn test_capture_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, sessions, store) = recorder(tmp.path());

        assert!(matches!(
            recorder.handle(r#"{"startRecording":true,"initialState":{"score":0}}"#).await.unwrap(),
            Handled::Started
        ));
        assert!(sessions.is_recording());
        for frame in [
            r#"{"type":"INC"}"#,
            r#"{"type":"KEY","payload":{"code":"ArrowUp"}}"#,
            r#"{"hello":"world"}"#,
            r#"{"type":"DEC","payload":{"value":1}}"#,
        ] {
            recorder.handle(frame).await.unwrap();
        }

        let handled = recorder
            .handle(r#"{"stopRecording":true,"name":"Run 1","impurities":{"seed":42}}"#)
            .await
            .unwrap();
        let Handled::Stopped(saved) = handled else {
            panic!("expected the recording to be saved");
        };
        assert_eq!(saved.name, "run-1");
        assert!(!saved.updated);
        assert_eq!(saved.post_process.await.unwrap().unwrap(), 0);
        assert!(!sessions.is_recording());

        let rec = store.load("run-1").await.unwrap();
        assert_eq!(rec.initial_state, json!({"score": 0}));
        assert_eq!(
            rec.dispatches,
            vec![json!({"type": "INC"}), json!({"type": "DEC", "payload": {"value": 1}})]
        );
        assert_eq!(rec.key_presses, vec![json!({"type": "KEY", "payload": {"code": "ArrowUp"}})]);
        assert_eq!(rec.impurities, json!({"seed": 42}));
        assert!(rec.images.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_state_commands_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, _sessions, store) = recorder(tmp.path());

        assert!(matches!(
            recorder.handle(r#"{"type":"INC"}"#).await.unwrap(),
            Handled::Ignored
        ));
        assert!(matches!(
            recorder.handle(r#"{"stopRecording":true,"name":"x"}"#).await.unwrap(),
            Handled::Ignored
        ));
        assert!(!store.exists("x").await);

        assert!(recorder.start(json!({"first": true})));
        assert!(!recorder.start(json!({"second": true})));
        let saved = recorder.stop(Some("x"), Value::Null).await.unwrap().unwrap();
        saved.post_process.await.unwrap().unwrap();
        assert_eq!(store.load("x").await.unwrap().initial_state, json!({"first": true}));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, _, _) = recorder(tmp.path());
        assert!(recorder.handle("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_default_name_is_a_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, _, store) = recorder(tmp.path());
        recorder.start(Value::Null);
        let saved = recorder.stop(None, Value::Null).await.unwrap().unwrap();
        assert!(saved.name.parse::<i64>().is_ok());
        assert!(store.exists(&saved.name).await);
    }

    #[tokio::test]
    async fn test_rerecord_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, _, store) = recorder(tmp.path());

        recorder.start(json!({"take": 1}));
        recorder.ingest(json!({"type": "OLD"}));
        recorder.stop(Some("run1"), Value::Null).await.unwrap().unwrap();
        std::fs::write(store.session_dir("run1").join("shot.png"), b"png").unwrap();

        recorder.start(json!({"take": 2}));
        let saved = recorder.stop(Some("run1"), Value::Null).await.unwrap().unwrap();
        assert!(saved.updated);
        assert!(!store.session_dir("run1").join("shot.png").exists());

        let rec = store.load("run1").await.unwrap();
        assert_eq!(rec.initial_state, json!({"take": 2}));
        assert!(rec.dispatches.is_empty());
    }

    #[tokio::test]
    async fn test_images_embedded_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, sessions, store) = recorder(tmp.path());

        recorder.start(json!({"sprite": "/img/player.png"}));
        recorder.ingest(json!({"type": "LOAD", "payload": {"img": "http://cdn/tile.jpg"}}));
        sessions.push_xhr_response(json!({
            "headers": {"statusCode": 200},
            "body": ["/img/player.png"]
        }));
        let saved = recorder.stop(Some("imgs"), Value::Null).await.unwrap().unwrap();
        assert_eq!(saved.post_process.await.unwrap().unwrap(), 2);

        let rec = store.load("imgs").await.unwrap();
        assert_eq!(
            rec.images["/img/player.png"],
            ImageData::Inline("data:image/png;base64,aW1n".into())
        );
        assert_eq!(
            rec.images["http://cdn/tile.jpg"],
            ImageData::Inline("data:image/jpg;base64,aW1n".into())
        );
        // References stay in place on disk; they are inlined at replay time.
        assert_eq!(rec.initial_state, json!({"sprite": "/img/player.png"}));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_first_write() {
        let tmp = tempfile::tempdir().unwrap();
        let (recorder, _, store) = recorder(tmp.path());

        recorder.start(json!(["/img/a.png", "/img/missing.png"]));
        let saved = recorder.stop(Some("broken"), Value::Null).await.unwrap().unwrap();
        assert!(saved.post_process.await.unwrap().is_err());

        let rec = store.load("broken").await.unwrap();
        assert!(rec.images.is_empty());
        assert_eq!(rec.initial_state, json!(["/img/a.png", "/img/missing.png"]));
    }

    #[tokio::test]
    async fn test_rerecord_while_images_download() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = Arc::new(Sessions::new());
        let store = Store::new(tmp.path());
        let recorder = Recorder::new(sessions, store.clone(), Arc::new(SlowFetcher));

        recorder.start(json!({"take": 1, "img": "/img/a.png"}));
        let first = recorder.stop(Some("run1"), Value::Null).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        recorder.start(json!({"take": 2}));
        let second = recorder.stop(Some("run1"), Value::Null).await.unwrap().unwrap();
        assert!(second.updated);

        assert_eq!(first.post_process.await.unwrap().unwrap(), 0);
        assert_eq!(second.post_process.await.unwrap().unwrap(), 0);

        let rec = store.load("run1").await.unwrap();
        assert_eq!(rec.initial_state, json!({"take": 2}));
        assert!(rec.images.is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_recording() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the recordings directory should be.
        let root = tmp.path().join("not-a-dir");
        std::fs::write(&root, b"").unwrap();
        let (recorder, sessions, _) = recorder(&root);

        recorder.start(json!({"score": 0}));
        recorder.ingest(json!({"type": "INC"}));
        assert!(recorder.stop(Some("run1"), Value::Null).await.is_err());

        assert!(sessions.is_recording());
        let recording = sessions.take_recording().unwrap();
        assert_eq!(recording.dispatches, vec![json!({"type": "INC"})]);
    }
}
