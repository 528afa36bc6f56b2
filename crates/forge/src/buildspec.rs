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

//! Buildspec parsing: `metaopspec(opspec(targetspec...))`.
//!
//! Each level is optional: a bare target list means the default
//! meta-operation and the operation implied by the subcommand, an
//! `op(...)` wrapper selects the operation, and a full
//! `metaop(op(...))` selects both.

use anyhow::bail;

use forgebuild::{Action, MetaOp, Op};

#[derive(Debug, PartialEq, Eq)]
pub struct BuildSpec {
    pub action: Action,
    pub targets: Vec<String>,
}

/// Parse command-line target arguments into buildspecs. Plain target
/// names accumulate under the default action; parenthesized specs stand
/// on their own.
pub fn parse(args: &[String], default_op: Op) -> anyhow::Result<Vec<BuildSpec>> {
    let mut plain: Vec<String> = Vec::new();
    let mut specs: Vec<BuildSpec> = Vec::new();

    for arg in args {
        if arg.contains('(') {
            specs.push(parse_spec(arg, default_op)?);
        } else {
            plain.push(arg.clone());
        }
    }

    if !plain.is_empty() || specs.is_empty() {
        specs.insert(
            0,
            BuildSpec {
                action: Action::new(MetaOp::Perform, default_op),
                targets: plain,
            },
        );
    }
    Ok(specs)
}

fn parse_spec(s: &str, default_op: Op) -> anyhow::Result<BuildSpec> {
    let (head, rest) = match s.split_once('(') {
        Some(parts) => parts,
        None => bail!("invalid buildspec `{}`", s),
    };
    let rest = match rest.strip_suffix(')') {
        Some(r) => r,
        None => bail!("invalid buildspec `{}`: missing `)`", s),
    };

    // metaop(op(...)) or op(...).
    if let Some((inner_head, inner_rest)) = rest.split_once('(') {
        let meta = MetaOp::parse(head.trim())?;
        let inner_rest = match inner_rest.strip_suffix(')') {
            Some(r) => r,
            None => bail!("invalid buildspec `{}`: missing `)`", s),
        };
        let op = Op::parse(inner_head.trim())?;
        return Ok(BuildSpec {
            action: Action::new(meta, op),
            targets: split_targets(inner_rest),
        });
    }

    let head = head.trim();
    // A bare metaop spec (`perform(...)`) keeps the default operation.
    if let Ok(meta) = MetaOp::parse(head) {
        return Ok(BuildSpec {
            action: Action::new(meta, default_op),
            targets: split_targets(rest),
        });
    }
    let op = Op::parse(head)?;
    Ok(BuildSpec {
        action: Action::new(MetaOp::Perform, op),
        targets: split_targets(rest),
    })
}

fn split_targets(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebuild::{PERFORM_CLEAN, PERFORM_UPDATE};

    #[test]
    fn bare_targets_take_default_op() {
        let specs = parse(
            &["exe{hello}".to_string(), "obj{main}".to_string()],
            Op::Update,
        )
        .unwrap();
        assert_eq!(
            specs,
            vec![BuildSpec {
                action: PERFORM_UPDATE,
                targets: vec!["exe{hello}".to_string(), "obj{main}".to_string()],
            }]
        );
    }

    #[test]
    fn empty_args_mean_default_everything() {
        let specs = parse(&[], Op::Update).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].targets.is_empty());
        assert_eq!(specs[0].action, PERFORM_UPDATE);
    }

    #[test]
    fn op_spec() {
        let specs = parse(&["clean(exe{hello})".to_string()], Op::Update).unwrap();
        assert_eq!(
            specs,
            vec![BuildSpec {
                action: PERFORM_CLEAN,
                targets: vec!["exe{hello}".to_string()],
            }]
        );
    }

    #[test]
    fn metaop_op_spec() {
        let specs =
            parse(&["configure(update(exe{a} obj{b}))".to_string()], Op::Update).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(
            specs[0].action,
            Action::new(MetaOp::Configure, Op::Update)
        );
        assert_eq!(specs[0].targets, vec!["exe{a}", "obj{b}"]);
    }

    #[test]
    fn disfigure_specs() {
        let specs =
            parse(&["disfigure(update(exe{a}))".to_string()], Op::Update).unwrap();
        assert_eq!(
            specs[0].action,
            Action::new(MetaOp::Disfigure, Op::Update)
        );

        // A bare meta-op spec keeps the default operation.
        let specs = parse(&["disfigure(exe{a})".to_string()], Op::Update).unwrap();
        assert_eq!(
            specs[0].action,
            Action::new(MetaOp::Disfigure, Op::Update)
        );
        assert_eq!(specs[0].targets, vec!["exe{a}"]);
    }

    #[test]
    fn invalid_specs() {
        assert!(parse(&["bogus(x)".to_string()], Op::Update).is_err());
        assert!(parse(&["update(x".to_string()], Op::Update).is_err());
    }
}
