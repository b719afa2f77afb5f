// SimNet: deterministic SDN data-plane simulator written in Rust
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use crate::controller::*;

#[test]
fn placeholders_are_substituted() {
    let c = Controller::new(
        1,
        vec![
            "./pox.py".to_string(),
            "openflow.of_01".to_string(),
            "--address=__address__".to_string(),
            "--port=__port__".to_string(),
        ],
        6634,
    )
    .with_address("10.0.0.1");
    assert_eq!(
        c.resolved_cmdline(),
        vec![
            "./pox.py",
            "openflow.of_01",
            "--address=10.0.0.1",
            "--port=6634"
        ]
    );
    // the template is kept
    assert_eq!(c.cmdline[2], "--address=__address__");
    assert_eq!(c.label(), "c1");
}

#[test]
fn multiple_placeholders_in_one_argument() {
    let c = Controller::new(0, vec!["tcp:__address__:__port__".to_string()], 6633);
    assert_eq!(c.resolved_cmdline(), vec!["tcp:127.0.0.1:6633"]);
}

#[test]
fn empty_cmdline() {
    let c = Controller::new(0, Vec::new(), 6633);
    assert!(c.resolved_cmdline().is_empty());
}
