use super::*;
use serial_test::serial;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.logging.format, LogFormat::Compact);
    assert_eq!(settings.engine.backend, EngineBackend::Katex);
    assert_eq!(
        settings.engine.core_capabilities,
        ["base", "ams", "newcommand", "noundefined"]
    );
    assert_eq!(settings.engine.timeout, Duration::from_millis(3000));
    assert!(!settings.engine.recover_after_failure);
    assert!(settings.speech.sre.is_none());
    assert_eq!(settings.raster.dpi, 96);
    assert_eq!(settings.cache.response_max_bytes, 64 * 1024 * 1024);
    assert_eq!(settings.errors.mode, ErrorMode::Inline);
    assert_eq!(settings.errors.max_message_chars, 200);
    assert_eq!(settings.limits.max_formula_chars, 20_000);
}

#[test]
fn failure_outlook_follows_recovery_setting() {
    let mut settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert!(settings.engine.failure_outlook().contains("stays failed"));

    settings.engine.recover_after_failure = true;
    assert_eq!(
        settings.engine.failure_outlook(),
        "requests will retry initialization"
    );
}

#[test]
fn only_worker_backend_output_rasterizes() {
    assert!(!EngineBackend::Katex.supports_raster());
    assert!(EngineBackend::Worker.supports_raster());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.errors.mode = Some("inline".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        errors_mode: Some("status".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.errors.mode, ErrorMode::Status);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn worker_backend_requires_a_command() {
    let mut raw = RawSettings::default();
    raw.engine.backend = Some("worker".to_string());
    let err = Settings::from_raw(raw.clone()).expect_err("missing command");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "engine.worker_command",
            ..
        }
    ));

    raw.engine.worker_command = Some("node".to_string());
    raw.engine.worker_args = Some(vec!["worker.js".to_string()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.engine.worker,
        Some(ProcessCommand {
            program: "node".to_string(),
            args: vec!["worker.js".to_string()],
        })
    );
}

#[test]
fn core_capabilities_are_normalized() {
    let mut raw = RawSettings::default();
    raw.engine.core_capabilities = Some(vec![
        " ams".to_string(),
        "base".to_string(),
        "ams".to_string(),
        String::new(),
    ]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.engine.core_capabilities, ["ams", "base"]);
}

#[test]
fn invalid_values_name_their_key() {
    let cases: [(fn(&mut RawSettings), &str); 6] = [
        (|raw| raw.server.port = Some(0), "server.port"),
        (|raw| raw.engine.backend = Some("mathjax".into()), "engine.backend"),
        (|raw| raw.engine.timeout_ms = Some(0), "engine.timeout_ms"),
        (|raw| raw.raster.dpi = Some(4), "raster.dpi"),
        (|raw| raw.errors.mode = Some("loud".into()), "errors.mode"),
        (|raw| raw.cache.response_limit = Some(0), "cache.response_limit"),
    ];

    for (mutate, expected) in cases {
        let mut raw = RawSettings::default();
        mutate(&mut raw);
        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected),
            other => panic!("expected invalid `{expected}`, got {other:?}"),
        }
    }
}

#[test]
fn blank_speech_commands_are_disabled() {
    let mut raw = RawSettings::default();
    raw.speech.sre_command = Some("  ".to_string());
    raw.speech.mathcat_command = Some("mathcat-worker".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.speech.sre.is_none());
    assert_eq!(
        settings.speech.mathcat.map(|command| command.program),
        Some("mathcat-worker".to_string())
    );
}

#[test]
fn render_arguments_become_query_pairs() {
    let args = CliArgs::try_parse_from([
        "mathgate",
        "render",
        "x^2",
        "--format",
        "png",
        "-o",
        "dpi=192",
        "--engine-backend",
        "katex",
    ])
    .expect("parse");

    let Some(Command::Render(render)) = args.command else {
        panic!("expected render command");
    };
    assert_eq!(
        render.query_pairs().expect("pairs"),
        vec![
            ("tex".to_string(), "x^2".to_string()),
            ("png".to_string(), "true".to_string()),
            ("dpi".to_string(), "192".to_string()),
        ]
    );

    let mut raw = RawSettings::default();
    raw.apply_render_overrides(&render.overrides);
    assert_eq!(raw.engine.backend.as_deref(), Some("katex"));
}

#[test]
fn malformed_render_option_is_rejected() {
    let args = CliArgs::try_parse_from(["mathgate", "render", "x", "-o", "scale"]).expect("parse");
    let Some(Command::Render(render)) = args.command else {
        panic!("expected render command");
    };
    assert!(render.query_pairs().is_err());
}

fn cli_with_file(path: &std::path::Path) -> CliArgs {
    CliArgs {
        config_file: Some(path.to_path_buf()),
        command: None,
    }
}

#[test]
#[serial]
fn config_file_and_environment_are_layered() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"
[engine]
timeout_ms = 1500
core_capabilities = ["base", "mhchem"]

[errors]
mode = "status"
"#,
    )
    .expect("write config");

    // SAFETY: serialized with every other test touching the environment.
    unsafe { std::env::set_var("MATHGATE__ENGINE__TIMEOUT_MS", "2500") };
    let loaded = load(&cli_with_file(file.path()));
    unsafe { std::env::remove_var("MATHGATE__ENGINE__TIMEOUT_MS") };

    let settings = loaded.expect("layered settings");
    assert_eq!(settings.engine.timeout, Duration::from_millis(2500));
    assert_eq!(settings.engine.core_capabilities, ["base", "mhchem"]);
    assert_eq!(settings.errors.mode, ErrorMode::Status);
}

#[test]
#[serial]
fn missing_config_file_is_an_error() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let err = load(&cli_with_file(&dir.path().join("absent.toml"))).expect_err("file is required");
    assert!(matches!(err, LoadError::Build(_)));
}
