// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

fn main() {
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["proto"])
        .inputs(["proto/fileformat.proto", "proto/osmformat.proto"])
        .cargo_out_dir("osmpbf")
        .run_from_script();

    println!("cargo:rerun-if-changed=proto");
    println!("cargo:rerun-if-changed=migrations");
}
