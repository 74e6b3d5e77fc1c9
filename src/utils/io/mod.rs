// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

/// Converts a TOML file represented as a string to `S`
///
/// # Example
/// ```
/// use serde::Deserialize;
/// use car_builder::utils::io::read_toml;
///
/// #[derive(Deserialize)]
/// struct Config {
///     chunk_size: usize
/// };
///
/// let toml_string = "chunk_size = 262144\n";
/// let config: Config = read_toml(toml_string).unwrap();
/// assert_eq!(config.chunk_size, 262144);
/// ```
pub fn read_toml<S>(toml_string: &str) -> anyhow::Result<S>
where
    for<'de> S: serde::de::Deserialize<'de>,
{
    let new_struct: S = toml::from_str(toml_string)?;
    Ok(new_struct)
}
