//! Quoting safety checked against a real shell: whatever goes into the
//! template must come back out of `echo` byte-for-byte.

use uxec::{Engine, ShellValue};

async fn echo_round_trip(engine: &Engine, input: &str) {
    let result = engine
        .run(&["echo ", ""], &[input.into()])
        .await
        .unwrap_or_else(|e| panic!("echo failed for {input:?}: {e}"));
    assert_eq!(result.text(), input, "round trip broke for {input:?}");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn plain_and_spaced_strings_round_trip() {
    let engine = Engine::with_defaults();
    for input in [
        "simple",
        "two words",
        "path/with/slashes",
        "dots.and:colons=equals@at",
        "  leading and trailing  ",
    ] {
        echo_round_trip(&engine, input).await;
    }
}

#[tokio::test]
async fn shell_metacharacters_round_trip() {
    let engine = Engine::with_defaults();
    for input in [
        "$HOME",
        "`id`",
        "$(id)",
        "a;b&&c||d",
        "star * and question ?",
        "redirect > /dev/null",
        "pipe | tee",
        "hash # comment",
        "paren (sub) shell",
        "double \"quotes\"",
        "single 'quotes'",
        "back\\slash",
    ] {
        echo_round_trip(&engine, input).await;
    }
}

#[tokio::test]
async fn injection_payload_round_trips_inert() {
    let engine = Engine::with_defaults();
    echo_round_trip(&engine, "'; rm -rf /; echo '").await;
    echo_round_trip(&engine, "\"; cat /etc/passwd; echo \"").await;
}

#[tokio::test]
async fn scalar_values_render_naturally() {
    let engine = Engine::with_defaults();
    let result = engine
        .run(
            &["echo ", " ", " ", ""],
            &[ShellValue::from(42i64), true.into(), 2.5f64.into()],
        )
        .await
        .unwrap();
    assert_eq!(result.text(), "42 true 2.5");
}

#[tokio::test]
async fn list_values_expand_to_multiple_arguments() {
    let engine = Engine::with_defaults();
    let flags: ShellValue = vec!["-l", "-a"].into();
    let result = engine
        .run(&["printf '%s\\n' ", ""], &[flags])
        .await
        .unwrap();
    assert_eq!(result.lines(), vec!["-l", "-a"]);
}

#[tokio::test]
async fn absent_values_disappear() {
    let engine = Engine::with_defaults();
    let missing: ShellValue = Option::<&str>::None.into();
    let result = engine
        .run(&["echo a", "b"], &[missing])
        .await
        .unwrap();
    assert_eq!(result.text(), "ab");
}
