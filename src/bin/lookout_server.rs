// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use lookout::lookout_server::server_main;

fn main() {
    // No inference runtime is linked into this binary; the model detector
    // reports empty detections until one is supplied.
    server_main("Lookout", |_args| None);
}
