//! Geo commands over sorted sets scored by 52-bit geohash.

use super::write_collection;
use crate::engine::{Arity, Command, CommandRegistry, CommandResult, CommandSpec, Reply};
use crate::error::{ConfigError, EngineError, ValidationError};
use crate::storage::geo::{self, CoordinateError, Unit};
use crate::storage::{ShardStore, SortedSet, Value};
use bytes::Bytes;

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(CommandSpec::new("GEOADD", Arity::AtLeast(4), cmd_geoadd).key(0).write())?;
    registry.register(CommandSpec::new("GEOPOS", Arity::AtLeast(1), cmd_geopos).key(0).readonly())?;
    registry.register(
        CommandSpec::new("GEODIST", Arity::Between(3, 4), cmd_geodist)
            .key(0)
            .readonly(),
    )?;
    registry.register(
        CommandSpec::new("GEOHASH", Arity::AtLeast(1), cmd_geohash)
            .key(0)
            .readonly(),
    )?;
    Ok(())
}

/// Coordinates of `member`, decoded from its score.
fn position(set: &SortedSet, member: &[u8]) -> Option<(f64, f64)> {
    set.score(member).map(|score| geo::decode(score as u64))
}

/// GEOADD key [NX | XX] [CH] longitude latitude member [...]
///
/// Every triple is checked before anything is written.
fn cmd_geoadd(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let mut nx = false;
    let mut xx = false;
    let mut ch = false;

    let mut i = 1;
    while let Some(keyword) = cmd.keyword(i) {
        match keyword.as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            "CH" => ch = true,
            _ => break,
        }
        i += 1;
    }
    if nx && xx {
        return Err(EngineError::invalid(
            "XX and NX options at the same time are not compatible",
        ));
    }

    let triples = &cmd.args[i..];
    if triples.is_empty() || triples.len() % 3 != 0 {
        return Err(ValidationError::WrongArity("geoadd".into()).into());
    }

    let mut points: Vec<(Bytes, f64)> = Vec::with_capacity(triples.len() / 3);
    for (n, triple) in triples.chunks(3).enumerate() {
        let longitude = cmd.float_arg(i + n * 3)?;
        let latitude = cmd.float_arg(i + n * 3 + 1)?;
        if let Err(e) = geo::validate(longitude, latitude) {
            let message = match e {
                CoordinateError::Longitude => "invalid longitude",
                CoordinateError::Latitude => "invalid latitude",
            };
            return Err(EngineError::invalid(message));
        }
        points.push((triple[2].clone(), geo::encode(longitude, latitude) as f64));
    }

    let object = write_collection(store, &cmd.args[0], "zset", || {
        Value::SortedSet(SortedSet::new())
    })?;
    let set = object.as_sorted_set_mut()?;

    let mut added = 0;
    let mut changed = 0;
    for (member, score) in points {
        match set.score(&member) {
            Some(_) if nx => {}
            None if xx => {}
            Some(old) => {
                if old != score {
                    set.insert(member, score);
                    changed += 1;
                }
            }
            None => {
                set.insert(member, score);
                added += 1;
            }
        }
    }

    Ok(Reply::from(if ch { added + changed } else { added }))
}

/// GEOPOS key member [member ...]
///
/// Nil for a missing key; nil entries for missing members.
fn cmd_geopos(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Nil);
    };
    let set = object.as_sorted_set()?;

    let positions = cmd.args[1..]
        .iter()
        .map(|member| match position(set, member) {
            Some((longitude, latitude)) => {
                Reply::Array(vec![Reply::float(longitude), Reply::float(latitude)])
            }
            None => Reply::Nil,
        })
        .collect();
    Ok(Reply::Array(positions))
}

/// GEODIST key member1 member2 [M | KM | FT | MI]
fn cmd_geodist(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let unit = match cmd.args.get(3) {
        Some(unit) => Unit::parse(unit).ok_or_else(|| {
            EngineError::invalid("unsupported unit provided. please use M, KM, FT, MI")
        })?,
        None => Unit::Meters,
    };

    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Nil);
    };
    let set = object.as_sorted_set()?;

    let (Some(from), Some(to)) = (position(set, &cmd.args[1]), position(set, &cmd.args[2])) else {
        return Ok(Reply::Nil);
    };
    let meters = geo::distance(from.0, from.1, to.0, to.1);
    Ok(Reply::bulk(format!("{:.4}", geo::round_distance(meters, unit))))
}

/// GEOHASH key member [member ...]
fn cmd_geohash(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let set = match store.get(&cmd.args[0]) {
        Some(object) => Some(object.as_sorted_set()?),
        None => None,
    };

    let hashes = cmd.args[1..]
        .iter()
        .map(|member| {
            set.and_then(|set| set.score(member))
                .map_or(Reply::Nil, |score| {
                    Reply::bulk(geo::to_geohash_string(score as u64))
                })
        })
        .collect();
    Ok(Reply::Array(hashes))
}
