// forge: A general-purpose, change-driven build system.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

//! End-to-end engine scenarios driven through the library API with the
//! stand-in compiler.

#![cfg(unix)]

mod util;

use util::{clean, depdb_lines, tick, update, TestProject};

fn manifest_json(p: &TestProject, targets: &str) -> String {
    format!(
        r#"{{
            "name": "proj",
            "vars": {{ "cc.path": "{}" }},
            "targets": [ {} ]
        }}"#,
        p.fake_cc().display(),
        targets
    )
}

/// E1/E2: the first build creates the depdb (self-describing prefix plus
/// the discovered header) and the object; an immediate rebuild does
/// nothing.
#[test]
fn first_build_and_noop_rebuild() {
    let p = TestProject::new();
    p.file("main.cxx", "#include \"lib.hxx\"\nint main() {}\n");
    p.file("lib.hxx", "struct lib {};\n");
    p.file(
        "forge.json",
        &manifest_json(&p, r#"{ "name": "obj{main}", "prerequisites": ["cxx{main}"] }"#),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);

    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert!(s.ran >= 1, "first build must do work");

    let obj = p.out().join("main.o");
    assert!(obj.is_file());

    // Rule id, compiler checksum, options checksum, source path, then the
    // discovered header.
    let dd = depdb_lines(&p.out().join("main.o.d"));
    assert_eq!(dd.len(), 5, "depdb was: {:?}", dd);
    assert_eq!(dd[0], "cc.compile 1");
    assert_eq!(dd[3], p.root.join("main.cxx").display().to_string());
    assert_eq!(dd[4], p.root.join("lib.hxx").display().to_string());

    // E2: no-op rebuild.
    tick();
    ctx.targets.reset();
    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert_eq!(s.ran, 0, "second build must be a no-op");
}

/// E3: touching a header re-runs the compile; the depdb keeps the same
/// header list.
#[test]
fn header_touch_recompiles() {
    let p = TestProject::new();
    p.file("main.cxx", "#include \"lib.hxx\"\nint main() {}\n");
    p.file("lib.hxx", "struct lib {};\n");
    p.file(
        "forge.json",
        &manifest_json(&p, r#"{ "name": "obj{main}", "prerequisites": ["cxx{main}"] }"#),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);
    update(&ctx, &roots);
    let before = depdb_lines(&p.out().join("main.o.d"));

    tick();
    p.file("lib.hxx", "struct lib {};\n"); // same content, new mtime

    tick();
    ctx.targets.reset();
    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert_eq!(s.ran, 1, "exactly the object must rebuild");
    assert_eq!(depdb_lines(&p.out().join("main.o.d")), before);
}

/// Property 5: only the objects that (transitively) include the touched
/// header rebuild.
#[test]
fn header_sensitivity_is_exact() {
    let p = TestProject::new();
    p.file("one.cxx", "#include \"dep.hxx\"\nint one() {}\n");
    p.file("dep.hxx", "#include \"deep.hxx\"\n");
    p.file("deep.hxx", "struct deep {};\n");
    p.file("two.cxx", "int two() {}\n");
    p.file(
        "forge.json",
        &manifest_json(
            &p,
            r#"{ "name": "obj{one}", "prerequisites": ["cxx{one}"] },
               { "name": "obj{two}", "prerequisites": ["cxx{two}"] }"#,
        ),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);
    let s = update(&ctx, &roots);
    assert_eq!((s.failed, s.ran >= 2), (0, true));

    tick();
    p.file("deep.hxx", "struct deep {};\n");

    tick();
    ctx.targets.reset();
    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert_eq!(s.ran, 1, "only obj{{one}} includes deep.hxx transitively");
}

/// E4: an option change invalidates the options checksum and recompiles;
/// the depdb is rewritten from the options line on.
#[test]
fn option_change_recompiles() {
    let p = TestProject::new();
    p.file("main.cxx", "int main() {}\n");
    p.file(
        "forge.json",
        &manifest_json(&p, r#"{ "name": "obj{main}", "prerequisites": ["cxx{main}"] }"#),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);
    update(&ctx, &roots);
    let before = depdb_lines(&p.out().join("main.o.d"));

    tick();
    roots[0].vars.write().assign(
        "cc.poptions",
        forgebuild::scope::Value::Strings(vec!["-DX".into()]),
    );
    ctx.targets.reset();
    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert_eq!(s.ran, 1);

    let after = depdb_lines(&p.out().join("main.o.d"));
    assert_eq!(after[0], before[0]);
    assert_eq!(after[1], before[1]);
    assert_ne!(after[2], before[2], "options checksum must differ");
    assert_eq!(after[3], before[3]);
}

/// E5: a missing generated header is discovered relative, mapped through
/// the prefix map, generated by its ad hoc recipe, and the extraction
/// restarts until consistent.
#[test]
fn auto_generated_header() {
    let p = TestProject::new();
    p.file("main.cxx", "#include <gen/h.hxx>\nint main() {}\n");
    let out = p.out().display().to_string();
    p.file(
        "forge.json",
        &format!(
            r#"{{
                "name": "proj",
                "vars": {{ "cc.path": "{cc}" }},
                "targets": [
                    {{ "name": "obj{{main}}",
                       "prerequisites": ["cxx{{main}}"],
                       "vars": {{ "cc.poptions": ["-I", "{out}"] }} }},
                    {{ "name": "gen/hxx{{h}}",
                       "recipe": ["sh", "-c", "printf '#define H 1\\n' > $out"] }}
                ]
            }}"#,
            cc = p.fake_cc().display(),
            out = out,
        ),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);
    let obj = roots[0].clone();

    let s = update(&ctx, &[obj.clone()]);
    assert_eq!(s.failed, 0);

    let gen = p.out().join("gen").join("h.hxx");
    assert!(gen.is_file(), "the header must have been generated");
    assert!(p.out().join("main.o").is_file());

    let dd = depdb_lines(&p.out().join("main.o.d"));
    assert_eq!(dd.last().unwrap(), &gen.display().to_string());

    // And the follow-up build converges to a no-op.
    tick();
    ctx.targets.reset();
    let s = update(&ctx, &[obj]);
    assert_eq!((s.failed, s.ran), (0, 0));
}

/// Property 7: independent subgraphs do not affect each other, even when
/// one of them fails.
#[test]
fn parallel_independence() {
    let p = TestProject::new();
    p.file(
        "forge.json",
        r#"{
            "name": "proj",
            "targets": [
                { "name": "file{good}",
                  "recipe": ["sh", "-c", "echo ok > $out"] },
                { "name": "file{bad}",
                  "recipe": ["sh", "-c", "exit 1"] }
            ]
        }"#,
    );

    let mut ctx = p.ctx();
    ctx.jobs = 2;
    let roots = p.load(&ctx);

    let s = forgebuild::perform(&ctx, forgebuild::PERFORM_UPDATE, &roots).unwrap();
    assert_eq!(s.failed, 1);
    assert!(p.out().join("good").is_file(), "the good subgraph completed");
    assert_eq!(
        roots[0].try_state(),
        Some(forgebuild::TargetState::Changed)
    );
    assert_eq!(
        roots[1].try_state(),
        Some(forgebuild::TargetState::Failed)
    );
}

/// Linking: the executable is rebuilt when an object changes, and clean
/// removes what update made.
#[test]
fn link_and_clean() {
    let p = TestProject::new();
    p.file("main.cxx", "int main() {}\n");
    p.file(
        "forge.json",
        &manifest_json(
            &p,
            r#"{ "name": "exe{hello}", "prerequisites": ["obj{main}"] },
               { "name": "obj{main}", "prerequisites": ["cxx{main}"] }"#,
        ),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);

    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    let exe = p.out().join("hello");
    assert!(exe.is_file());

    tick();
    p.file("main.cxx", "int main() { return 1; }\n");
    tick();
    ctx.targets.reset();
    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert_eq!(s.ran, 2, "the object and the executable rebuild");

    ctx.targets.reset();
    let s = clean(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert!(!exe.exists());
    assert!(!p.out().join("main.o").exists());
    assert!(!p.out().join("main.o.d").exists());
    // Source files are never cleaned.
    assert!(p.root.join("main.cxx").is_file());
}

/// An interrupted update (depdb newer than the object) forces a rebuild.
#[test]
fn interrupted_update_forces_rebuild() {
    let p = TestProject::new();
    p.file("main.cxx", "int main() {}\n");
    p.file(
        "forge.json",
        &manifest_json(&p, r#"{ "name": "obj{main}", "prerequisites": ["cxx{main}"] }"#),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);
    update(&ctx, &roots);

    // Simulate the interruption: the depdb got written but the object is
    // stale.
    tick();
    let dd = p.out().join("main.o.d");
    let content = std::fs::read(&dd).unwrap();
    std::fs::write(&dd, content).unwrap();

    tick();
    ctx.targets.reset();
    let s = update(&ctx, &roots);
    assert_eq!(s.failed, 0);
    assert_eq!(s.ran, 1, "a depdb newer than the target forces the rebuild");
}

/// Configure pins the derived compiler configuration in the out tree
/// without building anything; disfigure drops the pin again.
#[test]
fn configure_and_disfigure() {
    use forgebuild::{Action, MetaOp, Op};

    let p = TestProject::new();
    p.file("main.cxx", "int main() {}\n");
    p.file(
        "forge.json",
        &manifest_json(&p, r#"{ "name": "obj{main}", "prerequisites": ["cxx{main}"] }"#),
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);

    let configure = Action::new(MetaOp::Configure, Op::Update);
    let s = forgebuild::perform(&ctx, configure, &roots).unwrap();
    assert_eq!(s.failed, 0);
    assert!(s.ran >= 1, "writing the configuration counts as work");

    let cfg = p.out().join("config.json");
    assert!(cfg.is_file());
    let text = std::fs::read_to_string(&cfg).unwrap();
    assert!(text.contains("cc.path"), "config was: {}", text);
    assert!(text.contains("cc.checksum"), "config was: {}", text);
    // Configure plans but does not build.
    assert!(!p.out().join("main.o").exists());

    // A fresh load picks the pinned values up.
    let ctx2 = p.ctx();
    let _ = p.load(&ctx2);
    assert!(ctx2.root_var("cc.checksum").is_some());

    // Re-configuring with nothing changed rewrites nothing.
    let s = forgebuild::perform(&ctx, configure, &roots).unwrap();
    assert_eq!((s.failed, s.ran), (0, 0));

    let disfigure = Action::new(MetaOp::Disfigure, Op::Update);
    let s = forgebuild::perform(&ctx, disfigure, &roots).unwrap();
    assert_eq!((s.failed, s.ran), (0, 1));
    assert!(!cfg.exists());

    // Disfiguring twice is a no-op.
    let s = forgebuild::perform(&ctx, disfigure, &roots).unwrap();
    assert_eq!((s.failed, s.ran), (0, 0));
}

/// Testscripts attached to a testable target run in a scratch directory.
#[test]
fn testscript_runs() {
    let p = TestProject::new();
    p.file(
        "hello.testscript",
        "\
echo hello >=greeting
if ($0 != '')
  $0 >ok
end
",
    );
    p.file(
        "forge.json",
        r#"{
            "name": "proj",
            "targets": [
                { "name": "exe{hello}",
                  "recipe": ["sh", "-c", "printf '#!/bin/sh\necho ok\n' > $out && chmod +x $out"],
                  "prerequisites": ["testscript{hello}"],
                  "test": true }
            ]
        }"#,
    );

    let ctx = p.ctx();
    let roots = p.load(&ctx);

    let s = forgebuild::perform(&ctx, forgebuild::PERFORM_TEST, &roots).unwrap();
    assert_eq!(s.failed, 0, "testscript must pass");
}
