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

use std::fmt;
use std::sync::Arc;

use crate::action::Action;
use crate::context::BuildContext;
use crate::target::{Target, TargetState};

pub type RecipeFn =
    Arc<dyn Fn(&BuildContext, Action, &Arc<Target>) -> anyhow::Result<TargetState> + Send + Sync>;

/// What `apply` hands back: the function run at execute time.
#[derive(Clone)]
pub enum Recipe {
    /// Nothing to do; the target ends up unchanged.
    Noop,
    /// Delegate to the prerequisites: changed if any of them changed.
    Default,
    /// Delegate to group members (a see-through target's constituents).
    Group,
    Exec(RecipeFn),
}

impl Recipe {
    pub fn exec<F>(f: F) -> Recipe
    where
        F: Fn(&BuildContext, Action, &Arc<Target>) -> anyhow::Result<TargetState>
            + Send
            + Sync
            + 'static,
    {
        Recipe::Exec(Arc::new(f))
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Recipe::Noop)
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipe::Noop => write!(f, "Recipe::Noop"),
            Recipe::Default => write!(f, "Recipe::Default"),
            Recipe::Group => write!(f, "Recipe::Group"),
            Recipe::Exec(_) => write!(f, "Recipe::Exec(..)"),
        }
    }
}
