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

use petgraph::graph::{DiGraph, NodeIndex};

/// Recover one concrete dependency cycle through `start`, as the list of
/// target names `start -> ... -> start`, for the manifest diagnostic.
///
/// A depth-first walk that keeps the current path on an explicit stack:
/// the first edge leading back to `start` closes the cycle and the stack
/// at that moment is the path. `start` comes from a failed toposort, so it
/// is known to sit on a cycle; the single-name fallback only guards
/// against being handed anything else.
pub fn find_cycle(g: &DiGraph<String, ()>, start: NodeIndex) -> Vec<String> {
    let mut visited = vec![false; g.node_count()];
    visited[start.index()] = true;
    let mut stack = vec![(start, g.neighbors(start))];

    loop {
        let step = match stack.last_mut() {
            Some((_, edges)) => edges.next(),
            None => break,
        };
        match step {
            Some(n) if n == start => {
                let mut path: Vec<String> =
                    stack.iter().map(|(n, _)| g[*n].clone()).collect();
                path.push(g[start].clone());
                return path;
            }
            Some(n) if !visited[n.index()] => {
                visited[n.index()] = true;
                stack.push((n, g.neighbors(n)));
            }
            // Already explored and not the start: no cycle this way.
            Some(_) => {}
            None => {
                stack.pop();
            }
        }
    }
    vec![g[start].clone()]
}
