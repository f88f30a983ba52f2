// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

pub mod analysis_context;
pub mod call_site;
pub mod known_names;
pub mod method_info;
