//! Integration tests for the build pipeline and reuse-or-build flow,
//! driven through the in-memory runtime.

use std::sync::Arc;

use modelbake_core::cache::LABEL_BASE_IMAGE;
use modelbake_core::{
    BakeConfig, CleanupPolicy, MaterializeOutcome, Materializer, ModelDescriptor, ProvisionError,
    ProvisionState, Provisioner, StepKind, TargetImage,
};
use modelbake_session::fakes::FakeRuntime;
use modelbake_session::{ContainerRuntime, ImageLabels, StartOptions};

const BASE: &str = "ollama/ollama:0.1.44";

fn descriptor() -> ModelDescriptor {
    ModelDescriptor::new("org/model-gguf", "model-q4.gguf").expect("valid descriptor")
}

fn target() -> TargetImage {
    TargetImage::new("model-served", BASE).expect("valid target")
}

fn materializer(runtime: &FakeRuntime, config: BakeConfig) -> Materializer {
    Materializer::new(Arc::new(runtime.clone()), config)
}

/// Test: first call builds, second call reuses without any build step
#[tokio::test]
async fn test_idempotent_reuse_skips_build() {
    let runtime = FakeRuntime::new().with_image(BASE);
    let materializer = materializer(&runtime, BakeConfig::default());

    let mut first = materializer
        .materialize(&descriptor(), &target())
        .await
        .expect("first materialize failed");
    assert!(first.was_built());
    first.session.stop().await.unwrap();

    let execs_after_build = runtime.exec_log().len();
    assert_eq!(runtime.exec_count_containing("huggingface-cli"), 1);

    let mut second = materializer
        .materialize(&descriptor(), &target())
        .await
        .expect("second materialize failed");
    assert!(matches!(second.outcome, MaterializeOutcome::Reused));
    assert_eq!(second.session.base_image(), "model-served");
    second.session.stop().await.unwrap();

    assert_eq!(runtime.exec_log().len(), execs_after_build, "reuse must not exec");
    assert_eq!(runtime.exec_count_containing("huggingface-cli"), 1);
    assert_eq!(runtime.commits().len(), 1);
}

/// Test: a failure at any pipeline step leaves no target image behind
#[tokio::test]
async fn test_failure_at_each_step_produces_no_image() {
    let failing_tokens = [
        ("update", "refresh_index"),
        ("upgrade", "upgrade_packages"),
        ("python3-pip", "install_pip"),
        ("huggingface-hub", "install_hub_client"),
        ("download", "download_primary"),
        ("cat > Modelfile", "write_definition"),
        ("create", "register"),
        ("rm", "cleanup"),
    ];

    for (token, step) in failing_tokens {
        let runtime = FakeRuntime::new()
            .with_image(BASE)
            .fail_exec_containing(token, 1, "boom");
        let err = materializer(&runtime, BakeConfig::default())
            .materialize(&descriptor(), &target())
            .await
            .expect_err("materialize should fail");

        assert_eq!(err.failed_step(), Some(step), "token {token}");
        assert!(!runtime.has_image("model-served"), "image after failure at {step}");
        assert!(runtime.commits().is_empty());
    }
}

/// Test: base start failure, commit failure and transport failure are fatal
#[tokio::test]
async fn test_other_fatal_paths_produce_no_image() {
    let runtime = FakeRuntime::new();
    let err = materializer(&runtime, BakeConfig::default())
        .materialize(&descriptor(), &target())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ImagePull { ref image, .. } if image == BASE));

    let runtime = FakeRuntime::new().with_image(BASE).fail_commit("no space left on device");
    let err = materializer(&runtime, BakeConfig::default())
        .materialize(&descriptor(), &target())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Commit { .. }));
    assert!(!runtime.has_image("model-served"));

    let runtime = FakeRuntime::new()
        .with_image(BASE)
        .break_exec_containing("huggingface-cli", "connection reset by peer");
    let err = materializer(&runtime, BakeConfig::default())
        .materialize(&descriptor(), &target())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Transport { .. }));
    assert_eq!(err.failed_step(), Some("download_primary"));
    assert!(!runtime.has_image("model-served"));
}

/// Test: a non-zero exit is reported once and never retried
#[tokio::test]
async fn test_fatal_step_is_not_retried() {
    let runtime = FakeRuntime::new()
        .with_image(BASE)
        .fail_exec_containing("huggingface-cli", 1, "404 Client Error: Repository Not Found");

    let err = Provisioner::new(BakeConfig::default())
        .provision(&runtime, &descriptor(), &target())
        .await
        .unwrap_err();

    match err {
        ProvisionError::StepExecution {
            step,
            command,
            exit_code,
            stderr,
        } => {
            assert_eq!(step, "download_primary");
            assert!(command.starts_with("huggingface-cli download org/model-gguf model-q4.gguf"));
            assert_eq!(exit_code, 1);
            assert!(stderr.contains("Repository Not Found"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(runtime.exec_count_containing("huggingface-cli"), 1);
    assert_eq!(runtime.exec_count_containing("ollama"), 0, "no step after the failure");
}

/// Test: explicit definition text reaches the container byte-for-byte
#[tokio::test]
async fn test_definition_text_round_trip() {
    let text = "FROM ./llava-phi-3-mini-int4.gguf\nFROM ./llava-phi-3-mini-mmproj-f16.gguf\nTEMPLATE \"\"\"<|user|>\n{{ .Prompt }}<|end|>\n<|assistant|>\n\"\"\"\nPARAMETER stop \"<|end|>\"\nPARAMETER num_keep 4\nPARAMETER num_ctx 4096\n";
    let d = ModelDescriptor::builder("xtuner/llava-phi-3-mini-gguf", "llava-phi-3-mini-int4.gguf")
        .adapter_weight_file("llava-phi-3-mini-mmproj-f16.gguf")
        .definition_text(text)
        .build()
        .unwrap();
    let runtime = FakeRuntime::new().with_image(BASE);

    Provisioner::new(BakeConfig::default())
        .provision(&runtime, &d, &TargetImage::new("llava-phi3-served", BASE).unwrap())
        .await
        .unwrap();

    let log = runtime.exec_log();
    let write = log
        .iter()
        .find(|r| r.mentions("cat > Modelfile"))
        .expect("definition write executed");
    assert_eq!(write.stdin.as_deref(), Some(text.as_bytes()));
    assert_eq!(runtime.exec_count_containing("huggingface-cli"), 2);
}

/// Test: default definition text is derived from the primary weight file
#[tokio::test]
async fn test_default_definition_derivation() {
    let runtime = FakeRuntime::new().with_image(BASE);

    Provisioner::new(BakeConfig::default())
        .provision(&runtime, &descriptor(), &target())
        .await
        .unwrap();

    let log = runtime.exec_log();
    let write = log.iter().find(|r| r.mentions("cat > Modelfile")).unwrap();
    assert_eq!(write.stdin.as_deref(), Some(b"FROM model-q4.gguf".as_slice()));

    let register = log.iter().find(|r| r.mentions("create")).unwrap();
    assert_eq!(register.argv, vec!["ollama", "create", "model-q4.gguf", "-f", "Modelfile"]);
}

/// Test: the build session is stopped exactly once on every terminal outcome
#[tokio::test]
async fn test_build_session_stopped_exactly_once() {
    let scenarios: Vec<(&str, FakeRuntime)> = vec![
        ("success", FakeRuntime::new().with_image(BASE)),
        (
            "step failure",
            FakeRuntime::new().with_image(BASE).fail_exec_containing("upgrade", 100, "E: dpkg"),
        ),
        (
            "transport failure",
            FakeRuntime::new().with_image(BASE).break_exec_containing("create", "EOF"),
        ),
        ("commit failure", FakeRuntime::new().with_image(BASE).fail_commit("read-only")),
    ];

    for (name, runtime) in scenarios {
        let _ = Provisioner::new(BakeConfig::default())
            .provision(&runtime, &descriptor(), &target())
            .await;

        let started = runtime.started_sessions();
        assert_eq!(started.len(), 1, "{name}");
        assert_eq!(runtime.stop_count(&started[0].0), 1, "{name}");
    }
}

/// Test: Skip keeps the weights, BestEffort tolerates a failed removal
#[tokio::test]
async fn test_cleanup_policies() {
    let runtime = FakeRuntime::new().with_image(BASE);
    let skip = BakeConfig {
        cleanup: CleanupPolicy::Skip,
        ..BakeConfig::default()
    };
    let report = Provisioner::new(skip)
        .provision(&runtime, &descriptor(), &target())
        .await
        .unwrap();
    assert!(report.steps.iter().all(|s| s.kind != StepKind::Cleanup));
    assert_eq!(runtime.exec_count_containing("rm"), 0);

    let runtime = FakeRuntime::new()
        .with_image(BASE)
        .fail_exec_containing("rm", 1, "Permission denied");
    let best_effort = BakeConfig {
        cleanup: CleanupPolicy::BestEffort,
        ..BakeConfig::default()
    };
    let report = Provisioner::new(best_effort)
        .provision(&runtime, &descriptor(), &target())
        .await
        .unwrap();
    assert_eq!(report.final_state(), Some(ProvisionState::Committed));
    assert!(runtime.has_image("model-served"));
}

/// Test: committed images carry labels that later cache hits are checked against
#[tokio::test]
async fn test_compatibility_labels() {
    let runtime = FakeRuntime::new().with_image(BASE);
    let materializer = materializer(&runtime, BakeConfig::default());

    let mut built = materializer.materialize(&descriptor(), &target()).await.unwrap();
    built.session.stop().await.unwrap();
    let labels = runtime.labels_of("model-served").unwrap();
    assert_eq!(labels[LABEL_BASE_IMAGE], BASE);

    let newer = TargetImage::new("model-served", "ollama/ollama:0.1.48").unwrap();
    let err = materializer.materialize(&descriptor(), &newer).await.unwrap_err();
    assert!(matches!(err, ProvisionError::IncompatibleImage { .. }));
    assert_eq!(runtime.commits().len(), 1, "incompatible hit must not rebuild");

    let lenient = materializer_with_labels_disabled(&runtime);
    let mut reused = lenient.materialize(&descriptor(), &newer).await.unwrap();
    assert!(!reused.was_built());
    reused.session.stop().await.unwrap();
}

fn materializer_with_labels_disabled(runtime: &FakeRuntime) -> Materializer {
    materializer(
        runtime,
        BakeConfig {
            enforce_compatibility: false,
            ..BakeConfig::default()
        },
    )
}

/// Test: images built out-of-band (no labels) are reused
#[tokio::test]
async fn test_unlabelled_image_is_reused() {
    let runtime = FakeRuntime::new().with_labelled_image("model-served", ImageLabels::new());

    let mut reused = materializer(&runtime, BakeConfig::default())
        .materialize(&descriptor(), &target())
        .await
        .unwrap();
    assert!(!reused.was_built());
    assert!(reused.endpoint().is_some());
    reused.session.stop().await.unwrap();
    assert!(runtime.exec_log().is_empty());
}

/// Test: concurrent materializations of one image build it once
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_flight_per_image() {
    let runtime = FakeRuntime::new().with_image(BASE);
    let materializer = Arc::new(materializer(&runtime, BakeConfig::default()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let materializer = materializer.clone();
            tokio::spawn(async move { materializer.materialize(&descriptor(), &target()).await })
        })
        .collect();

    let mut built = 0;
    for handle in handles {
        let mut materialized = handle.await.unwrap().unwrap();
        if materialized.was_built() {
            built += 1;
        }
        materialized.session.stop().await.unwrap();
    }

    assert_eq!(built, 1);
    assert_eq!(runtime.commits(), vec!["model-served".to_string()]);
    assert_eq!(runtime.exec_count_containing("huggingface-cli"), 1);
}

/// Test: the serving session of a fresh build is a new container from the target
#[tokio::test]
async fn test_built_outcome_returns_fresh_serving_session() {
    let runtime = FakeRuntime::new().with_image(BASE);

    let mut materialized = materializer(&runtime, BakeConfig::default())
        .materialize(&descriptor(), &target())
        .await
        .unwrap();

    let report = materialized.outcome.report().expect("build report").clone();
    assert_ne!(report.session_id, materialized.session.id());
    assert_eq!(materialized.session.base_image(), "model-served");
    assert!(runtime
        .start("model-served", &StartOptions::local_only())
        .await
        .is_ok());

    materialized.session.stop().await.unwrap();
}

/// Test: end-to-end against a real Docker daemon and the Hugging Face hub
#[tokio::test]
#[ignore = "requires Docker, network access and a real model repository"]
async fn test_end_to_end_generate() {
    use modelbake_serving::{GenerateRequest, ServingClient};
    use modelbake_session::{DockerConfig, DockerRuntime};

    let runtime = Arc::new(DockerRuntime::new(DockerConfig::default()).unwrap());
    let materializer = Materializer::new(runtime, BakeConfig::default());

    let d = descriptor();
    let mut materialized = materializer.materialize(&d, &target()).await.unwrap();
    let endpoint = materialized.endpoint().unwrap().to_string();

    let client = ServingClient::new(&endpoint).unwrap();
    client.ensure_model_listed(&d.served_model()).await.unwrap();
    let response = client
        .ensure_generates(&GenerateRequest::new(d.served_model(), "hello"))
        .await
        .unwrap();
    assert!(!response.is_empty());

    materialized.session.stop().await.unwrap();
}
