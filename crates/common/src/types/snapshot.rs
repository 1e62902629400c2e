// Spytrace - Line-level execution tracer
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

use crate::types::Variables;

/// State of the traced program when a given line was about to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Source file of the line
    pub filename: String,
    /// Line number (1-based)
    pub line_number: u32,
    /// Literal source text of the line, without trailing whitespace
    pub line_content: String,
    /// Local bindings, when captured
    pub locals: Option<Variables>,
    /// Global bindings, when captured
    pub globals: Option<Variables>,
}

impl Snapshot {
    /// Field names in declaration order, used as the CSV header.
    pub const FIELDS: [&'static str; 5] =
        ["filename", "line_number", "line_content", "locals", "globals"];
}
