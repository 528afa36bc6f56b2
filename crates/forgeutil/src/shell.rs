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

//! Rendering of command lines for diagnostics and dry-run output.

/// Join the given arguments into a single shell-quoted line.
pub fn join<'a>(args: impl IntoIterator<Item = &'a str>) -> String {
    shlex::try_join(args.into_iter()).expect("failed to join args with shlex, likely due to null bytes")
}

/// Render a program plus its arguments.
pub fn render(program: &str, args: &[String]) -> String {
    join(std::iter::once(program).chain(args.iter().map(|a| a.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_spaces() {
        let args = vec!["-I".to_string(), "dir with space".to_string()];
        assert_eq!(render("cc", &args), "cc -I 'dir with space'");
    }
}
