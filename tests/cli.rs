use assert_cmd::Command;
use predicates::prelude::*;

fn cyris() -> Command {
    Command::cargo_bin("cyris").unwrap()
}

const DESCRIPTION_FIXTURE: &str = r#"
host_settings:
  - id: host1
    mgmt_addr: "127.0.0.1"
    virbr_addr: "192.168.122.1"
    account: root

guest_settings:
  - id: g1
    basevm_host: host1
    basevm_config_file: null
    basevm_type: Kvm
    basevm_os_type: linux
    ip_addr: null
    root_passwd: null
    tasks: []

clone_settings:
  - range_id: "101"
    hosts:
      - host_id: host1
        instance_number: 1
        guests:
          - guest_id: g1
            number: 1
            entry_point: false
        topology:
          networks: []
          forwarding_rules: []
"#;

fn settings_yaml(ranges_dir: &std::path::Path) -> String {
    format!(
        "cyris_path: /opt/cyris\ncyber_range_dir: {}\ngw_mode: false\ngw_account: ''\ngw_mgmt_addr: ''\ngw_inside_addr: ''\nuser_email: ''\nlibvirt_uri: qemu:///session\ndefault_subnet: 192.168.122.0/24\nentry_port_low: 60000\nentry_port_high: 65000\nssh_pool_max_connections: 10\ngw_password_length: 12\ndefault_image_url: null\n",
        ranges_dir.display()
    )
}

#[test]
fn help_describes_the_subcommands() {
    cyris()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cyber range orchestrator"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("destroy"));
}

#[test]
fn config_init_writes_defaults_non_interactively() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("settings.yml");

    // stdin is piped (not a tty) so config-init falls back to the
    // unattended default settings instead of prompting.
    cyris()
        .arg("config-init")
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote environment settings"));

    let contents = std::fs::read_to_string(&out).unwrap();
    assert!(contents.contains("cyber_range_dir"));
    assert!(contents.contains("libvirt_uri"));
}

#[test]
fn config_init_refuses_to_overwrite_non_interactively() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("settings.yml");
    std::fs::write(&out, "existing: true\n").unwrap();

    cyris()
        .arg("config-init")
        .arg("--out")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn config_show_prints_the_resolved_settings() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.yml");
    let ranges_dir = dir.path().join("ranges");
    std::fs::write(&settings_path, settings_yaml(&ranges_dir)).unwrap();

    cyris()
        .arg("--settings")
        .arg(&settings_path)
        .arg("config-show")
        .assert()
        .success()
        .stdout(predicate::str::contains("qemu:///session"));
}

#[test]
fn missing_settings_file_reports_load_failure() {
    cyris()
        .arg("--settings")
        .arg("/nonexistent/settings.yml")
        .arg("status")
        .arg("101")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn status_on_a_fresh_registry_reports_range_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.yml");
    let ranges_dir = dir.path().join("ranges");
    std::fs::create_dir_all(&ranges_dir).unwrap();
    std::fs::write(&settings_path, settings_yaml(&ranges_dir)).unwrap();

    cyris()
        .arg("--settings")
        .arg(&settings_path)
        .arg("status")
        .arg("101")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn dry_run_create_validates_topology_without_touching_anything() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.yml");
    let ranges_dir = dir.path().join("ranges");
    let description_path = dir.path().join("description.yml");
    std::fs::write(&description_path, DESCRIPTION_FIXTURE).unwrap();
    std::fs::write(&settings_path, settings_yaml(&ranges_dir)).unwrap();

    cyris()
        .arg("--settings")
        .arg(&settings_path)
        .arg("create")
        .arg(&description_path)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run OK"))
        .stdout(predicate::str::contains("101"));

    // a dry run must not create the range directory or any registry file
    assert!(!ranges_dir.join("ranges_metadata.json").exists());
}

#[test]
fn create_rejects_a_description_referencing_an_unknown_host() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.yml");
    let ranges_dir = dir.path().join("ranges");
    let description_path = dir.path().join("description.yml");
    std::fs::write(
        &description_path,
        r#"
host_settings: []
guest_settings: []
clone_settings:
  - range_id: "202"
    hosts:
      - host_id: ghost
        instance_number: 1
        guests: []
        topology:
          networks: []
          forwarding_rules: []
"#,
    )
    .unwrap();
    std::fs::write(&settings_path, settings_yaml(&ranges_dir)).unwrap();

    cyris()
        .arg("--settings")
        .arg(&settings_path)
        .arg("create")
        .arg(&description_path)
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}
