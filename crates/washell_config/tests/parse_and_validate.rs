use washell_config::ShellConfig;

#[test]
fn test_parse_and_validate() {
    let config = ShellConfig::load("tests/fixtures/basic.yaml").unwrap();
    assert_eq!(config.name, "basic");
    assert_eq!(config.app.args, vec!["dash", "-i"]);
    assert_eq!(config.app.env.len(), 2);
    assert_eq!(config.app.env.get("PATH").unwrap(), "/bin:/usr/bin");
    assert_eq!(config.app.env.get("HOME").unwrap(), "/root");
    assert_eq!(config.app.preopened_dir.as_deref().unwrap().to_str(), Some("."));

    let image = config.guest_image_path().unwrap();
    assert!(image.is_absolute());
    assert!(image.ends_with("guest/dash.wasm"));
}

#[test]
fn test_minimal_config() {
    let config = ShellConfig::load("tests/fixtures/minimal.yaml").unwrap();
    assert_eq!(config.name, "minimal");
    assert!(config.app.args.is_empty());
    assert!(config.app.env.is_empty());
    assert!(config.guest_image_path().is_none());
}

#[test]
fn test_empty_name() {
    let err = ShellConfig::load("tests/fixtures/empty_name.yaml").unwrap_err();
    assert_eq!(err, "Name is required in the name field");
}

#[test]
fn test_env_key_with_equals_sign() {
    let err = ShellConfig::load("tests/fixtures/bad_env.yaml").unwrap_err();
    assert_eq!(
        err,
        "Environment variable name must not contain '=': BAD=KEY"
    );
}

#[test]
fn test_missing_file() {
    let err = ShellConfig::load("tests/fixtures/no_such_file.yaml").unwrap_err();
    assert!(err.starts_with("Failed to open file"));
}
