/*
sfmap, to encode and flash sparse images: pretty printing module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

const SUFFIXES: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

pub(crate) fn human_bytes(bytes: u64) -> String {
    let mut number = bytes as f64;
    let mut suffix_id = 0;
    while number >= 1024.0 && suffix_id + 1 < SUFFIXES.len() {
        number /= 1024.0;
        suffix_id += 1;
    }
    if suffix_id == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", number, SUFFIXES[suffix_id])
    }
}

pub(crate) fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
