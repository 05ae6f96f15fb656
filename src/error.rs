/*
sfmap, to encode and flash sparse images: error module
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

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("record codec error: {0}")]
    CodecError(#[from] bincode::Error),
    #[error("invalid progress bar template: {0}")]
    TemplateError(#[from] indicatif::style::TemplateError),
    #[error("malformed SFMap: {0}")]
    SFMapError(#[from] crate::sfmap::SFMapError),
    #[error("replay failed: {0}")]
    ReplayError(#[from] crate::replay::ReplayError),
    #[error("writer thread panicked")]
    WriterPanicked,
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
