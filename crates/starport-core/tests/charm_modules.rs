//! The charm modules installed together over one local data directory.

use mlua::Lua;
use starport_core::charm::DEFAULT_DB;
use starport_core::retry::CancelToken;
use starport_core::{Modules, Settings};
use tempfile::TempDir;

fn setup() -> (TempDir, Lua) {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.charm.data_dir = Some(dir.path().join("charm").to_string_lossy().into_owned());
    settings.charm.host = Some("charm.test".into());
    let modules = Modules::from_settings(&settings, &CancelToken::new());
    let lua = Lua::new();
    modules.install(&lua).unwrap();
    (dir, lua)
}

#[test]
fn modules_share_one_account() {
    let (_dir, lua) = setup();
    let (a, b, c, host): (String, String, String, String) = lua
        .load("return ckv.get_bio().id, cfs.get_bio().id, cacc.get_userid(), cacc.get_host()")
        .eval()
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(host, "charm.test:35353");
}

#[test]
fn username_seen_by_modules_opened_later() {
    let (_dir, lua) = setup();
    let (own, other): (String, String) = lua
        .load(
            r#"
            cacc.set_username("orbit")
            return cacc.get_username(), ckv.get_bio().name
            "#,
        )
        .eval()
        .unwrap();
    assert_eq!(own, "orbit");
    assert_eq!(other, "orbit");
}

#[test]
fn username_seen_by_modules_already_open() {
    let (_dir, lua) = setup();
    let (before, kv_after, fs_after, own): (Option<String>, String, String, String) = lua
        .load(
            r#"
            local before = ckv.get_bio().name
            cfs.get_bio()
            cacc.set_username("orbit")
            return before, ckv.get_bio().name, cfs.get_bio().name, cacc.get_username()
            "#,
        )
        .eval()
        .unwrap();
    assert_eq!(before, None);
    assert_eq!(kv_after, "orbit");
    assert_eq!(fs_after, "orbit");
    assert_eq!(own, "orbit");
}

#[test]
fn kv_and_files_live_under_data_dir() {
    let (dir, lua) = setup();
    lua.load(
        r#"
        ckv.set("k", "v")
        ckv.set_json("cfg", {1, 2, 3}, "json")
        cfs.write("a/b.txt", "hello")
        "#,
    )
    .exec()
    .unwrap();
    let root = dir.path().join("charm");
    assert!(root.join("kv").join(DEFAULT_DB).join("kv.db").exists());
    assert!(root.join("kv").join("json").join("kv.db").exists());
    assert_eq!(std::fs::read_to_string(root.join("fs/a/b.txt")).unwrap(), "hello");
    assert!(root.join("account.json").exists());

    let total: i64 = lua
        .load("local t = ckv.get_json('cfg', 'json') return t[1] + t[2] + t[3]")
        .eval()
        .unwrap();
    assert_eq!(total, 6);
}

#[test]
fn get_config_reports_settings() {
    let (_dir, lua) = setup();
    let host: String = lua.load("return cfs.get_config().host").eval().unwrap();
    assert_eq!(host, "charm.test");
}

#[test]
fn require_finds_modules() {
    let (_dir, lua) = setup();
    let same: bool = lua.load("return require('ckv') == ckv and require('cacc') == cacc").eval().unwrap();
    assert!(same);
}
