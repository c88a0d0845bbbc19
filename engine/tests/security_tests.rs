//! Security tests for generated tools
//!
//! Generated sources are screened before registration and their outputs are
//! confined to the staging directory at run time.

use shield_engine::audit::MemoryAuditSink;
use shield_engine::config::Config;
use shield_engine::generator::script_tool::confine;
use shield_engine::generator::SandboxScreen;
use shield_engine::llm::ScriptedProvider;
use shield_engine::pipeline::{Overrides, Shield};
use shield_sdk::audit::{AuditOutcome, AuditStage};
use shield_sdk::errors::{FailureClass, ShieldError, ShieldErrorExt};
use std::sync::Arc;

fn screen() -> SandboxScreen {
    SandboxScreen::new(&Config::default().generator.allowed_imports).unwrap()
}

const HEADER: &str = "from tool_api import PrivacyTool\nimport cv2\n";

#[test]
fn test_denied_primitives_rejected() {
    let screen = screen();
    let cases = [
        ("import socket\n", "import"),
        ("import requests\n", "import"),
        ("from urllib.request import urlopen\n", "import"),
        ("x = eval('1 + 1')\n", "dynamic evaluation"),
        ("exec(code)\n", "dynamic evaluation"),
        ("m = __import__('os')\n", "dynamic evaluation"),
        ("os.system('ls')\n", "process spawn"),
        ("os.remove(path)\n", "file deletion"),
        ("shutil.rmtree(root)\n", "file deletion"),
        ("open('/etc/passwd', 'w')\n", "write outside output directory"),
        ("open('../escape.mp4', mode='wb')\n", "write outside output directory"),
        ("cv2.imwrite('/tmp/frame.png', frame)\n", "write outside output directory"),
    ];

    for (body, rule) in cases {
        let source = format!("{}{}", HEADER, body);
        let rejection = screen
            .screen(&source)
            .expect_err(&format!("accepted: {}", body.trim()));
        assert!(
            rejection.rule.contains(rule),
            "{} fired '{}' instead of '{}'",
            body.trim(),
            rejection.rule,
            rule
        );
        assert_eq!(rejection.line, 3);
    }
}

#[test]
fn test_indirect_escapes_rejected() {
    let screen = screen();
    let cases = [
        (
            "from pathlib import Path\nPath('/etc/shield_pwned').write_text('x')\n",
            "write outside output directory",
        ),
        ("Path('../up').mkdir(parents=True)\n", "write outside output directory"),
        ("np.save(arr, '~/stash.npy')\n", "write outside output directory"),
        ("import os\nos.popen('rm -rf ~')\n", "process spawn"),
        ("os.execvp('sh', ['sh'])\n", "process spawn"),
        ("os.spawnl(os.P_NOWAIT, '/bin/sh')\n", "process spawn"),
        ("os.rename('/etc/hosts', 'hosts')\n", "filesystem mutation"),
        ("os.replace(src, dst)\n", "filesystem mutation"),
        ("shutil.copy(src, dst)\n", "filesystem mutation"),
        ("open(os.path.expanduser('~/.bashrc'), 'a')\n", "home directory access"),
        ("home = os.environ['HOME']\n", "environment access"),
        ("f = getattr(__builtins__, 'ev' + 'al')\n", "reflection"),
        ("g = globals()['__builtins__']\n", "reflection"),
    ];

    for (body, rule) in cases {
        let source = format!("{}{}", HEADER, body);
        let rejection = screen
            .screen(&source)
            .expect_err(&format!("accepted: {}", body.trim()));
        assert_eq!(rejection.rule, rule, "{}", body.trim());
    }
}

#[test]
fn test_writing_open_must_target_output_dir() {
    let screen = screen();

    // Target is an input path, not something under output_dir
    let source = format!(
        "{}def apply(self, output_dir, video_path, **kw):\n    with open(video_path, 'w') as f:\n        f.write('x')\n",
        HEADER
    );
    let rejection = screen.screen(&source).unwrap_err();
    assert_eq!(rejection.rule, "write outside output directory");
    assert_eq!(rejection.matched, "video_path");
    assert_eq!(rejection.line, 4);

    // A call split over lines is still parsed
    let source = format!("{}log = open(\n    '/var/log/x',\n    mode='a',\n)\n", HEADER);
    assert_eq!(screen.screen(&source).unwrap_err().matched, "/var/log/x");

    // A derived name that climbs out again is not derived
    let source = format!(
        "{}out = output_dir + '/../../x'\nopen(out, 'wb')\n",
        HEADER
    );
    assert!(screen.screen(&source).is_err());

    // Mode held in a variable counts as a write
    let source = format!("{}open(target, mode)\n", HEADER);
    assert!(screen.screen(&source).is_err());

    let source = format!(
        "{}import os\ndef apply(self, **kwargs):\n    out = os.path.join(kwargs['output_dir'], 'plates.json')\n    \
         with open(out, 'w') as f:\n        f.write('{{}}')\n    open('summary.txt', 'a').close()\n    \
         data = open(kwargs['video_path']).read()\n",
        HEADER
    );
    assert!(screen.screen(&source).is_ok());
}

#[test]
fn test_ordinary_tool_passes() {
    let source = format!(
        "{}import numpy as np\nfrom pathlib import Path\n\n# eval( in a comment is fine\n\
         def apply(output_dir, **kw):\n    out = Path(output_dir) / 'frame.png'\n    \
         cv2.imwrite(str(out), np.zeros((4, 4)))\n    return {{'output_path': str(out)}}\n",
        HEADER
    );
    assert!(screen().screen(&source).is_ok());
}

#[test]
fn test_confine_resolves_inside_only() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(confine(dir.path(), "a/b.wav").unwrap(), dir.path().join("a/b.wav"));
    assert!(matches!(
        confine(dir.path(), "a/../../b.wav"),
        Err(ShieldError::SandboxViolation(_))
    ));
    let violation = confine(dir.path(), "/var/tmp/b.wav").unwrap_err();
    assert_eq!(violation.category(), "SandboxViolation");
    assert_eq!(violation.class(), FailureClass::Fatal);
}

#[tokio::test]
async fn test_unsafe_generation_never_registers() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path()).unwrap();
    let tools_dir = config.generator.tools_dir.clone();
    let audit = Arc::new(MemoryAuditSink::new());
    let llm = ScriptedProvider::from_fn(|messages| {
        if messages[0].content.contains("pipeline planner") {
            Some(r#"{"pipeline": [{"tool": "blur_license_plates"}]}"#.to_string())
        } else {
            Some(
                "from tool_api import PrivacyTool\nimport socket\n\
                 class Leak(PrivacyTool):\n    name = \"blur_license_plates\"\n"
                    .to_string(),
            )
        }
    });
    let shield = Shield::with_overrides(
        config,
        Overrides {
            llm: Some(Arc::new(llm)),
            audit: Some(Arc::clone(&audit) as Arc<dyn shield_engine::audit::AuditSink>),
            ..Overrides::default()
        },
    )
    .unwrap();

    let err = shield.plan("blur license plates").await.unwrap_err();

    assert!(matches!(err, ShieldError::PlanningFailure(_)));
    assert!(!shield.registry().contains("blur_license_plates"));
    assert!(!tools_dir.join("composites/blur_license_plates.py").exists());
    let failed_generations = audit
        .entries()
        .into_iter()
        .filter(|e| e.stage == AuditStage::Generate && e.outcome == AuditOutcome::Fail)
        .count();
    assert_eq!(failed_generations as u32, Config::default().generator.max_attempts);
}
