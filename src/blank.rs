/*
sfmap, to encode and flash sparse images: blank image module
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

use std::{fs::File, io::{BufWriter, Write}, path::Path};

use indicatif::ProgressBar;

use crate::{chunk::fill_sentinel, pretty::human_bytes, Result};

const SIZE_BLOCK: usize = 0x100000;

/// Write `size` MiB of the sentinel pattern
pub(crate) fn write_blank<W: Write>(writer: &mut W, size: u64, bar: &ProgressBar)
    -> Result<()>
{
    let mut block = vec![0; SIZE_BLOCK];
    fill_sentinel(&mut block);
    for _ in 0..size {
        writer.write_all(&block)?;
        bar.inc(SIZE_BLOCK as u64);
    }
    writer.flush()?;
    Ok(())
}

pub(crate) fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
    let path = path.as_ref();
    let file = match File::create(path) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Could not create blank image '{}': {}",
                path.display(), e);
            return Err(e.into())
        }
    };
    let length = size.saturating_mul(SIZE_BLOCK as u64);
    log::info!("Creating blank image '{}' ({})",
        path.display(), human_bytes(length));
    let bar = crate::progress::progress_bar_bytes(length, "Blanking")?;
    let mut writer = BufWriter::new(file);
    write_blank(&mut writer, size, &bar)?;
    bar.finish_and_clear();
    Ok(())
}
