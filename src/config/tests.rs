use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_memory_store_without_origin() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.storage.backend, StorageBackend::Memory);
    assert_eq!(settings.storage.directory, PathBuf::from(DEFAULT_STORAGE_DIR));
    assert_eq!(settings.engine.manifest, PathBuf::from(DEFAULT_MANIFEST));
    assert!(settings.engine.update_check.is_none());
    assert!(settings.upstream.origin.is_none());
    assert_eq!(
        settings.upstream.timeout,
        Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS)
    );
}

#[test]
fn upstream_origin_must_be_http() {
    let mut raw = RawSettings::default();
    raw.upstream.origin = Some("ftp://odds.local".to_string());

    let err = Settings::from_raw(raw).expect_err("ftp origin rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "upstream.origin",
            ..
        }
    ));
}

#[test]
fn upstream_origin_rejects_paths() {
    let mut raw = RawSettings::default();
    raw.upstream.origin = Some("http://odds.local/app".to_string());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn blank_origin_is_treated_as_missing() {
    let mut raw = RawSettings::default();
    raw.upstream.origin = Some("   ".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.upstream.origin.is_none());
}

#[test]
fn storage_backend_is_parsed_case_insensitively() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        storage: StorageOverrides {
            storage_backend: Some("Disk".to_string()),
            storage_directory: Some(PathBuf::from("/var/cache/sideline")),
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.storage.backend, StorageBackend::Disk);
    assert_eq!(
        settings.storage.directory,
        PathBuf::from("/var/cache/sideline")
    );
}

#[test]
fn unknown_storage_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.storage.backend = Some("redis".to_string());

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "storage.backend",
            ..
        })
    ));
}

#[test]
fn zero_update_interval_disables_checks() {
    let mut raw = RawSettings::default();
    raw.engine.update_check_seconds = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.engine.update_check.is_none());

    let mut raw = RawSettings::default();
    raw.engine.update_check_seconds = Some(15);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.engine.update_check, Some(Duration::from_secs(15)));
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

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["sideline"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_arguments() {
    let args = CliArgs::parse_from([
        "sideline",
        "serve",
        "--upstream-origin",
        "http://odds.local:8000",
        "--storage-backend",
        "disk",
        "--log-json",
        "true",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(
                serve.overrides.upstream_origin.as_deref(),
                Some("http://odds.local:8000")
            );
            assert_eq!(
                serve.overrides.storage.storage_backend.as_deref(),
                Some("disk")
            );
            assert_eq!(serve.overrides.log_json, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_regions_arguments() {
    let args = CliArgs::parse_from([
        "sideline",
        "regions",
        "--storage-directory",
        "/tmp/cache",
        "--prune-except",
        "egpwa-v9.5.x-001",
    ]);

    match args.command.expect("regions command") {
        Command::Regions(regions) => {
            assert_eq!(regions.prune_except.as_deref(), Some("egpwa-v9.5.x-001"));
            assert_eq!(
                regions.storage.storage_directory,
                Some(PathBuf::from("/tmp/cache"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
