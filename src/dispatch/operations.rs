//! Decoding of cache commands into engine operations.
//!
//! Single-key stores: `ADD <key> [flags=<u32>] [exp=<secs>] len=<n>\r\n<value>`.
//! Bulk stores carry every value back to back in the data block and a
//! `sizes=<n1>,<n2>,...` option giving each value's length in key order.

use crate::engine::{BulkItem, Operation};
use crate::error::HandlerError;
use crate::protocol::{Command, CommandType};

/// Build the engine operation for a cache command.
///
/// Returns `None` for command types the engine does not handle.
pub fn decode(cmd: &Command) -> Result<Option<Operation>, HandlerError> {
    let op = match cmd.kind {
        CommandType::Add => Operation::Add(single_item(cmd)?),
        CommandType::Insert => Operation::Insert(single_item(cmd)?),
        CommandType::AddBulk => Operation::AddBulk(bulk_items(cmd)?),
        CommandType::InsertBulk => Operation::InsertBulk(bulk_items(cmd)?),
        CommandType::Get => Operation::Get { key: key(cmd)? },
        CommandType::Remove => Operation::Remove { key: key(cmd)? },
        CommandType::Delete => Operation::Delete { key: key(cmd)? },
        CommandType::Contains => Operation::Contains { key: key(cmd)? },
        CommandType::GetBulk => Operation::GetBulk { keys: keys(cmd)? },
        CommandType::RemoveBulk => Operation::RemoveBulk { keys: keys(cmd)? },
        CommandType::DeleteBulk => Operation::DeleteBulk { keys: keys(cmd)? },
        CommandType::ContainsBulk => Operation::ContainsBulk { keys: keys(cmd)? },
        CommandType::Count => Operation::Count,
        CommandType::Clear => Operation::Clear,
        CommandType::RaiseCustomEvent => Operation::RaiseCustomEvent {
            payload: cmd.data.clone(),
        },
        _ => return Ok(None),
    };
    Ok(Some(op))
}

fn key(cmd: &Command) -> Result<String, HandlerError> {
    cmd.require_arg(0, "key").map(str::to_string)
}

fn keys(cmd: &Command) -> Result<Vec<String>, HandlerError> {
    if cmd.args.is_empty() {
        return Err(HandlerError::MissingArgument("key"));
    }
    Ok(cmd.args.clone())
}

fn store_options(cmd: &Command) -> Result<(u32, u64), HandlerError> {
    let flags = cmd.option_parsed("flags")?.unwrap_or(0);
    let ttl = cmd.option_parsed("exp")?.unwrap_or(0);
    Ok((flags, ttl))
}

fn single_item(cmd: &Command) -> Result<BulkItem, HandlerError> {
    let (flags, ttl) = store_options(cmd)?;
    Ok(BulkItem {
        key: key(cmd)?,
        value: cmd.data.clone(),
        flags,
        ttl,
    })
}

fn bulk_items(cmd: &Command) -> Result<Vec<BulkItem>, HandlerError> {
    let keys = keys(cmd)?;
    let (flags, ttl) = store_options(cmd)?;
    let sizes = cmd
        .option("sizes")
        .ok_or(HandlerError::MissingArgument("sizes"))?
        .split(',')
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| HandlerError::InvalidArgument(format!("bad value size '{s}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if sizes.len() != keys.len() {
        return Err(HandlerError::InvalidArgument(format!(
            "{} keys but {} sizes",
            keys.len(),
            sizes.len()
        )));
    }
    let total: usize = sizes.iter().sum();
    if total != cmd.data.len() {
        return Err(HandlerError::InvalidArgument(format!(
            "sizes add up to {total}, data holds {}",
            cmd.data.len()
        )));
    }

    let mut offset = 0;
    Ok(keys
        .into_iter()
        .zip(sizes)
        .map(|(key, size)| {
            let value = cmd.data.slice(offset..offset + size);
            offset += size;
            BulkItem {
                key,
                value,
                flags,
                ttl,
            }
        })
        .collect())
}
