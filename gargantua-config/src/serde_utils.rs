// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `deserialize_with` helpers that run configuration values through
//! `shellexpand`, so a file can say `"namespace": "${GARGANTUA_NAMESPACE}"`.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, de};

fn expand<E: de::Error>(value: &str) -> Result<String, E> {
    shellexpand::env(value)
        .map(|expanded| expanded.into_owned())
        .map_err(de::Error::custom)
}

fn parse_expanded<T, E>(value: &str) -> Result<T, E>
where
    T: FromStr,
    T::Err: fmt::Display,
    E: de::Error,
{
    expand::<E>(value)?.parse::<T>().map_err(de::Error::custom)
}

/// Accepts an integer, or a string that expands to one. Used for counts
/// such as worker threads and shard replicas.
pub fn convert_numeric_with_shellexpand<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + FromStr,
    <T as TryFrom<i64>>::Error: fmt::Display,
    <T as FromStr>::Err: fmt::Display,
{
    struct IntegerVisitor<T>(PhantomData<T>);

    impl<T> de::Visitor<'_> for IntegerVisitor<T>
    where
        T: TryFrom<i64> + FromStr,
        <T as TryFrom<i64>>::Error: fmt::Display,
        <T as FromStr>::Err: fmt::Display,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an integer or a string containing an integer")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
            T::try_from(v).map_err(de::Error::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
            let v = i64::try_from(v).map_err(de::Error::custom)?;
            self.visit_i64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
            parse_expanded(v)
        }
    }

    deserializer.deserialize_any(IntegerVisitor(PhantomData))
}

/// Same as `convert_numeric_with_shellexpand`, for rates and jitter factors.
pub fn convert_float_with_shellexpand<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: From<f32> + FromStr,
    <T as FromStr>::Err: fmt::Display,
{
    struct FloatVisitor<T>(PhantomData<T>);

    impl<T> de::Visitor<'_> for FloatVisitor<T>
    where
        T: From<f32> + FromStr,
        <T as FromStr>::Err: fmt::Display,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or a string containing a number")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<T, E> {
            Ok(T::from(v as f32))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
            Ok(T::from(v as f32))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
            Ok(T::from(v as f32))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
            parse_expanded(v)
        }
    }

    deserializer.deserialize_any(FloatVisitor(PhantomData))
}

pub fn convert_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    expand(&String::deserialize(deserializer)?)
}

/// A string that expands to nothing is treated as unset.
pub fn convert_optional_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let Some(value) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let expanded = expand::<D::Error>(&value)?;
    Ok((!expanded.is_empty()).then_some(expanded))
}
