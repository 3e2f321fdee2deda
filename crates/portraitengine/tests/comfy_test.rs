// crates/portraitengine/tests/comfy_test.rs

use mockito::{Matcher, Server};
use portraitcore::{
    AssetError, EngineError, EventBus, GraphBindings, PatchSet, PredictionParams, RunEvent, RunId,
    WorkflowGraph,
};
use portraitengine::{ensure_weights, ComfyEngine, HistoryEntry, OutputFile};
use portraitruntime::staging::{DRIVING_PREFIX, FACE_PREFIX};
use portraitruntime::{Engine, EngineJob, EngineLaunch, RunWorkspace, StagedInputs, WeightManifest};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::Duration;

const TEMPLATE: &str = include_str!("../../../workflow_api.json");

struct Run {
    _dir: TempDir,
    workspace: RunWorkspace,
    inputs: StagedInputs,
    graph: WorkflowGraph,
}

async fn prepare_run() -> Run {
    let dir = tempfile::tempdir().unwrap();
    let face = dir.path().join("me.jpeg");
    let video = dir.path().join("clip.mp4");
    std::fs::write(&face, b"png").unwrap();
    std::fs::write(&video, b"mp4").unwrap();

    let workspace = RunWorkspace::create(&dir.path().join("staging"), RunId::new_v4())
        .await
        .unwrap();
    let inputs = StagedInputs {
        face_image: workspace.stage_input(&face, FACE_PREFIX).await.unwrap(),
        driving_video: workspace.stage_input(&video, DRIVING_PREFIX).await.unwrap(),
    };

    let template = WorkflowGraph::from_json_str(TEMPLATE).unwrap();
    let graph = PatchSet::new(
        &PredictionParams::default(),
        inputs.face_image.name.as_str(),
        inputs.driving_video.name.as_str(),
    )
    .apply(&template, &GraphBindings::default())
        .unwrap();

    Run {
        _dir: dir,
        workspace,
        inputs,
        graph,
    }
}

fn engine_for(server: &Server) -> ComfyEngine {
    ComfyEngine::new(server.host_with_port()).with_poll_interval(Duration::from_millis(10))
}

fn history_body(prompt_id: &str, entry: serde_json::Value) -> String {
    let mut history = serde_json::Map::new();
    history.insert(prompt_id.to_string(), entry);
    serde_json::Value::Object(history).to_string()
}

#[tokio::test]
async fn test_health_check() {
    let mut server = Server::new_async().await;
    let stats = server
        .mock("GET", "/system_stats")
        .with_status(200)
        .with_body(r#"{"system": {"os": "posix"}, "devices": []}"#)
        .create_async()
        .await;

    engine_for(&server).health().await.unwrap();
    stats.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_engine_is_connection_error() {
    let engine = ComfyEngine::new("127.0.0.1:1");
    match engine.health().await {
        Err(EngineError::Connection { address, .. }) => assert_eq!(address, "127.0.0.1:1"),
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_uploads_queues_and_downloads() {
    let mut server = Server::new_async().await;
    let run = prepare_run().await;

    let face_upload = server
        .mock("POST", "/upload/image")
        .match_body(Matcher::Regex(r#"filename="face\.jpeg""#.to_string()))
        .with_status(200)
        .with_body(r#"{"name": "face.jpeg", "subfolder": "", "type": "input"}"#)
        .expect(1)
        .create_async()
        .await;
    let video_upload = server
        .mock("POST", "/upload/image")
        .match_body(Matcher::Regex(r#"filename="driving\.mp4""#.to_string()))
        .with_status(200)
        .with_body(r#"{"name": "driving.mp4", "subfolder": "", "type": "input"}"#)
        .expect(1)
        .create_async()
        .await;

    let prompt = server
        .mock("POST", "/prompt")
        .match_body(Matcher::PartialJson(json!({
            "prompt": {
                "4": {"inputs": {"image": "face.jpeg"}},
                "8": {"inputs": {"video": "driving.mp4", "frame_load_cap": 64}},
                "30": {"inputs": {"dsize": 512, "relative": true}}
            }
        })))
        .with_status(200)
        .with_body(r#"{"prompt_id": "abc", "number": 3, "node_errors": {}}"#)
        .create_async()
        .await;

    let history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body(history_body(
            "abc",
            json!({
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": {
                    "27": {"gifs": [{
                        "filename": "LivePortrait_00001.mp4",
                        "subfolder": "",
                        "type": "output",
                        "format": "video/h264-mp4"
                    }]},
                    "40": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]}
                }
            }),
        ))
        .create_async()
        .await;

    let view = server
        .mock("GET", "/view")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("filename".into(), "LivePortrait_00001.mp4".into()),
            Matcher::UrlEncoded("type".into(), "output".into()),
        ]))
        .with_status(200)
        .with_body("video bytes")
        .expect(1)
        .create_async()
        .await;

    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let events = bus.create_emitter(run.workspace.run_id());

    engine_for(&server)
        .submit(EngineJob {
            graph: &run.graph,
            inputs: &run.inputs,
            workspace: &run.workspace,
            events: &events,
        })
        .await
        .unwrap();

    face_upload.assert_async().await;
    video_upload.assert_async().await;
    prompt.assert_async().await;
    history.assert_async().await;
    view.assert_async().await;

    let outputs = run.workspace.collect_outputs().await.unwrap();
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].ends_with("LivePortrait_00001.mp4"));
    assert_eq!(std::fs::read(&outputs[0]).unwrap(), b"video bytes");

    match rx.try_recv() {
        Ok(RunEvent::EngineQueued { prompt_id, .. }) => assert_eq!(prompt_id, "abc"),
        other => panic!("expected queued event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_node_errors_reject_workflow() {
    let mut server = Server::new_async().await;
    let run = prepare_run().await;

    let _upload = server.mock("POST", "/upload/image").with_status(200).create_async().await;
    let _prompt = server
        .mock("POST", "/prompt")
        .with_status(200)
        .with_body(r#"{"prompt_id": "abc", "number": 1, "node_errors": {"30": {"errors": [{"message": "bad dsize"}]}}}"#)
        .create_async()
        .await;
    let history = server.mock("GET", "/history/abc").expect(0).create_async().await;

    let bus = EventBus::new(16);
    let events = bus.create_emitter(run.workspace.run_id());
    let result = engine_for(&server)
        .submit(EngineJob {
            graph: &run.graph,
            inputs: &run.inputs,
            workspace: &run.workspace,
            events: &events,
        })
        .await;

    match result {
        Err(EngineError::Rejected(msg)) => assert!(msg.contains("bad dsize")),
        other => panic!("expected rejection, got {:?}", other),
    }
    history.assert_async().await;
}

#[tokio::test]
async fn test_invalid_prompt_body_surfaced_verbatim() {
    let mut server = Server::new_async().await;
    let run = prepare_run().await;
    let body = r#"{"error": {"type": "prompt_no_outputs", "message": "Prompt has no outputs"}}"#;

    let _prompt = server
        .mock("POST", "/prompt")
        .with_status(400)
        .with_body(body)
        .create_async()
        .await;

    match engine_for(&server).queue_prompt(&run.graph).await {
        Err(EngineError::Rejected(msg)) => assert_eq!(msg, body),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execution_error_skips_download() {
    let mut server = Server::new_async().await;
    let run = prepare_run().await;

    let _upload = server.mock("POST", "/upload/image").with_status(200).create_async().await;
    let _prompt = server
        .mock("POST", "/prompt")
        .with_status(200)
        .with_body(r#"{"prompt_id": "abc", "number": 1, "node_errors": {}}"#)
        .create_async()
        .await;
    let _history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body(history_body(
            "abc",
            json!({
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", {"prompt_id": "abc"}],
                        ["execution_error", {
                            "prompt_id": "abc",
                            "node_id": "30",
                            "node_type": "LivePortraitProcess",
                            "exception_message": "No face detected in source image"
                        }]
                    ]
                },
                "outputs": {}
            }),
        ))
        .create_async()
        .await;
    let view = server.mock("GET", "/view").expect(0).create_async().await;

    let bus = EventBus::new(16);
    let events = bus.create_emitter(run.workspace.run_id());
    let result = engine_for(&server)
        .submit(EngineJob {
            graph: &run.graph,
            inputs: &run.inputs,
            workspace: &run.workspace,
            events: &events,
        })
        .await;

    match result {
        Err(EngineError::ExecutionFailed(msg)) => {
            assert_eq!(msg, "node 30 (LivePortraitProcess): No face detected in source image");
        }
        other => panic!("expected execution failure, got {:?}", other),
    }
    view.assert_async().await;
    assert!(run.workspace.collect_outputs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_clears_local_engine_dirs() {
    let mut server = Server::new_async().await;
    let run = prepare_run().await;
    let engine_root = tempfile::tempdir().unwrap();
    let launch = EngineLaunch {
        input_dir: engine_root.path().join("input"),
        output_dir: engine_root.path().join("output"),
        temp_dir: engine_root.path().join("temp"),
        ..Default::default()
    };
    for dir in [&launch.input_dir, &launch.output_dir, &launch.temp_dir] {
        std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(launch.input_dir.join("face.png"), b"someone else").unwrap();
    std::fs::write(launch.output_dir.join("LivePortrait_00007.mp4"), b"old run").unwrap();
    std::fs::write(launch.temp_dir.join("preview.png"), b"old run").unwrap();

    let _upload = server.mock("POST", "/upload/image").with_status(200).create_async().await;
    let _prompt = server
        .mock("POST", "/prompt")
        .with_status(200)
        .with_body(r#"{"prompt_id": "abc", "number": 1, "node_errors": {}}"#)
        .create_async()
        .await;
    let _history = server
        .mock("GET", "/history/abc")
        .with_status(200)
        .with_body(history_body(
            "abc",
            json!({"status": {"status_str": "success", "completed": true, "messages": []}, "outputs": {}}),
        ))
        .create_async()
        .await;

    let bus = EventBus::new(16);
    let events = bus.create_emitter(run.workspace.run_id());
    engine_for(&server)
        .with_local_dirs(&launch)
        .submit(EngineJob {
            graph: &run.graph,
            inputs: &run.inputs,
            workspace: &run.workspace,
            events: &events,
        })
        .await
        .unwrap();

    for dir in [&launch.input_dir, &launch.output_dir, &launch.temp_dir] {
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0, "{} not cleared", dir.display());
    }
}

#[test]
fn test_output_local_names() {
    let file = |filename: &str, subfolder: &str| OutputFile {
        filename: filename.to_string(),
        subfolder: subfolder.to_string(),
        kind: "output".to_string(),
    };

    assert_eq!(file("a.mp4", "").local_name().unwrap(), "a.mp4");
    assert_eq!(file("a.mp4", "lp/run1").local_name().unwrap(), "lp_run1_a.mp4");

    for (filename, subfolder) in [
        ("../escape.mp4", ""),
        ("/etc/passwd", ""),
        ("nested/a.mp4", ""),
        ("", ""),
        ("a.mp4", "../up"),
        ("a.mp4", "/abs"),
    ] {
        assert!(
            matches!(file(filename, subfolder).local_name(), Err(EngineError::Protocol(_))),
            "{:?} in {:?} accepted",
            filename,
            subfolder
        );
    }
}

#[tokio::test]
async fn test_same_name_in_different_subfolders_kept_apart() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    let _root = server
        .mock("GET", "/view")
        .match_query(Matcher::UrlEncoded("subfolder".into(), "".into()))
        .with_status(200)
        .with_body("root")
        .create_async()
        .await;
    let _nested = server
        .mock("GET", "/view")
        .match_query(Matcher::UrlEncoded("subfolder".into(), "x".into()))
        .with_status(200)
        .with_body("nested")
        .create_async()
        .await;

    let entry: HistoryEntry = serde_json::from_value(json!({
        "outputs": {
            "27": {"gifs": [{"filename": "a.mp4", "subfolder": "", "type": "output"}]},
            "28": {"gifs": [{"filename": "a.mp4", "subfolder": "x", "type": "output"}]}
        }
    }))
    .unwrap();

    let count = engine_for(&server).download_outputs(&entry, dir.path()).await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(std::fs::read(dir.path().join("a.mp4")).unwrap(), b"root");
    assert_eq!(std::fs::read(dir.path().join("x_a.mp4")).unwrap(), b"nested");
}

#[tokio::test]
async fn test_escaping_output_name_rejected() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let outputs = dir.path().join("outputs");
    std::fs::create_dir_all(&outputs).unwrap();
    let view = server.mock("GET", "/view").expect(0).create_async().await;

    let entry: HistoryEntry = serde_json::from_value(json!({
        "outputs": {"27": {"gifs": [{"filename": "../escape.mp4", "subfolder": "", "type": "output"}]}}
    }))
    .unwrap();

    let result = engine_for(&server).download_outputs(&entry, &outputs).await;
    assert!(matches!(result, Err(EngineError::Protocol(_))));
    assert!(!dir.path().join("escape.mp4").exists());
    view.assert_async().await;
}

#[test]
fn test_history_output_files() {
    let entry: HistoryEntry = serde_json::from_value(json!({
        "status": {"status_str": "success", "completed": true, "messages": []},
        "outputs": {
            "9": {"images": [{"filename": "b.png", "subfolder": "x", "type": "output"}], "animated": [false]},
            "27": {"gifs": [{"filename": "a.mp4", "subfolder": "", "type": "output"}]},
            "40": {"images": [{"filename": "c.png", "subfolder": "", "type": "temp"}]}
        }
    }))
    .unwrap();

    let names: Vec<String> = entry.output_files().into_iter().map(|f| f.filename).collect();
    assert_eq!(names, vec!["a.mp4", "b.png"]);
}

#[tokio::test]
async fn test_ensure_weights_downloads_missing() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let manifest = WeightManifest::live_portrait();

    for name in manifest.names() {
        if name != "landmark.onnx" {
            std::fs::write(dir.path().join(name), b"w").unwrap();
        }
    }

    let landmark = server
        .mock("GET", "/liveportrait/landmark.onnx")
        .with_status(200)
        .with_body("onnx")
        .expect(1)
        .create_async()
        .await;

    let base_url = format!("{}/liveportrait/", server.url());
    let downloaded = ensure_weights(&manifest, dir.path(), Some(&base_url)).await.unwrap();

    assert_eq!(downloaded, vec!["landmark.onnx"]);
    assert_eq!(std::fs::read(dir.path().join("landmark.onnx")).unwrap(), b"onnx");
    assert!(!dir.path().join("landmark.onnx.part").exists());
    landmark.assert_async().await;
}

#[tokio::test]
async fn test_ensure_weights_without_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = ensure_weights(&WeightManifest::live_portrait(), dir.path(), None).await;

    match result {
        Err(AssetError::MissingWeights(missing)) => assert_eq!(missing.len(), 6),
        other => panic!("expected missing weights, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_weight_download() {
    let mut server = Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let _missing = server.mock("GET", Matcher::Any).with_status(404).create_async().await;

    let result = ensure_weights(&WeightManifest::live_portrait(), dir.path(), Some(&server.url())).await;
    assert!(matches!(result, Err(AssetError::DownloadFailed { .. })));
}
