/*
sfmap, to encode and flash sparse images: progress module
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

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::Result;

const TEMPLATE_BYTES: &str = "{prefix} => [{elapsed_precise}] \
    {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}";

fn progress_style_with_template<S: AsRef<str>>(template: S)
    -> Result<ProgressStyle>
{
    let template = template.as_ref();
    match ProgressStyle::with_template(template) {
        Ok(style) => Ok(style.progress_chars("=> ")),
        Err(e) => {
            log::error!(
                "Failed to create progress bar style from template '{}': {}",
                template, e
            );
            Err(e.into())
        }
    }
}

/// A bar counting bytes out of `length`, labelled with `prefix`
pub(crate) fn progress_bar_bytes(length: u64, prefix: &'static str)
    -> Result<ProgressBar>
{
    let style = progress_style_with_template(TEMPLATE_BYTES)?;
    let bar = ProgressBar::new(length)
        .with_style(style)
        .with_prefix(prefix);
    bar.enable_steady_tick(Duration::from_secs(1));
    Ok(bar)
}
