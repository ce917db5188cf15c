//! Remote catalog metadata: loading and name resolution.

use crate::connection::Connection;
use crate::error::ClientError;
use rmpv::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tupledb_protocol::{IteratorKind, Request, RequestCode};

/// System catalog space holding space definitions.
const VSPACE_ID: u32 = 281;

/// System catalog space holding index definitions.
const VINDEX_ID: u32 = 289;

/// Upper bound on catalog rows fetched per scan.
const MAX_SCHEMA_ROWS: u32 = 10_000;

/// Read-mostly snapshot of the remote catalog, loaded once at connect time
/// and immutable afterwards.
///
/// Every entry reachable by name is also reachable by id and vice versa
/// (nameless fields are reachable by id only).
// TODO: reload the schema after a reconnect; ids resolved from this
// snapshot go stale if the catalog changed during the outage.
#[derive(Debug, Default)]
pub struct Schema {
    pub spaces: HashMap<String, Arc<Space>>,
    pub spaces_by_id: HashMap<u32, Arc<Space>>,
}

#[derive(Debug, Default)]
pub struct Space {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub temporary: bool,
    pub field_count: u32,
    pub fields: HashMap<String, Field>,
    pub fields_by_id: HashMap<u32, Field>,
    pub indexes: HashMap<String, Arc<Index>>,
    pub indexes_by_id: HashMap<u32, Arc<Index>>,
}

#[derive(Debug, Clone, Default)]
pub struct Field {
    pub id: u32,
    pub name: String,
    pub field_type: String,
}

#[derive(Debug, Default)]
pub struct Index {
    pub id: u32,
    pub name: String,
    pub kind: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

#[derive(Debug, Clone)]
pub struct IndexPart {
    pub field_no: u32,
    pub field_type: String,
}

/// Caller-supplied space reference: a name, a numeric id of any width, or
/// an already-resolved handle.
#[derive(Debug, Clone, Copy)]
pub enum SpaceRef<'a> {
    Name(&'a str),
    Id(u32),
    Space(&'a Space),
}

/// Caller-supplied index reference, same shapes as [`SpaceRef`].
#[derive(Debug, Clone, Copy)]
pub enum IndexRef<'a> {
    Name(&'a str),
    Id(u32),
    Index(&'a Index),
}

impl<'a> From<&'a str> for SpaceRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for SpaceRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a Space> for SpaceRef<'a> {
    fn from(space: &'a Space) -> Self {
        Self::Space(space)
    }
}

impl<'a> From<&'a str> for IndexRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for IndexRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a Index> for IndexRef<'a> {
    fn from(index: &'a Index) -> Self {
        Self::Index(index)
    }
}

macro_rules! numeric_refs {
    ($($ty:ty),*) => {$(
        impl From<$ty> for SpaceRef<'_> {
            fn from(id: $ty) -> Self {
                Self::Id(id as u32)
            }
        }
        impl From<$ty> for IndexRef<'_> {
            fn from(id: $ty) -> Self {
                Self::Id(id as u32)
            }
        }
    )*};
}

numeric_refs!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Schema {
    pub fn space(&self, name: &str) -> Option<&Arc<Space>> {
        self.spaces.get(name)
    }

    pub fn space_by_id(&self, id: u32) -> Option<&Arc<Space>> {
        self.spaces_by_id.get(&id)
    }

    /// Resolves a space/index reference pair to the numeric ids the wire
    /// protocol requires. An unknown name is an error; numeric ids pass
    /// through unvalidated.
    pub fn resolve(
        &self,
        space: SpaceRef<'_>,
        index: Option<IndexRef<'_>>,
    ) -> Result<(u32, u32), ClientError> {
        let (space_id, resolved) = match space {
            SpaceRef::Name(name) => match self.spaces.get(name) {
                Some(space) => (space.id, Some(space.as_ref())),
                None => return Err(ClientError::UnknownSpace(name.to_string())),
            },
            SpaceRef::Id(id) => (id, self.spaces_by_id.get(&id).map(Arc::as_ref)),
            SpaceRef::Space(space) => (space.id, Some(space)),
        };

        let index_id = match index {
            None => 0,
            Some(IndexRef::Id(id)) => id,
            Some(IndexRef::Index(index)) => index.id,
            Some(IndexRef::Name(name)) => {
                let space = resolved.ok_or(ClientError::UnknownSpaceId(space_id))?;
                match space.indexes.get(name) {
                    Some(index) => index.id,
                    None => {
                        return Err(ClientError::UnknownIndex {
                            space: space.name.clone(),
                            index: name.to_string(),
                        })
                    }
                }
            }
        };

        Ok((space_id, index_id))
    }
}

/// Loads the catalog snapshot by full-scanning the two system spaces.
pub(crate) async fn load(conn: &Arc<Connection>) -> Result<Schema, ClientError> {
    let space_rows = scan(conn, VSPACE_ID).await?;
    let index_rows = scan(conn, VINDEX_ID).await?;
    let schema = build(&space_rows, &index_rows)?;
    tracing::debug!(spaces = schema.spaces.len(), "schema loaded");
    Ok(schema)
}

async fn scan(conn: &Arc<Connection>, space_id: u32) -> Result<Vec<Value>, ClientError> {
    let mut request = Request::new(RequestCode::Select, conn.next_sync());
    request.fill_search(space_id, 0, &Vec::<u32>::new())?;
    request.fill_iterator(IteratorKind::All, 0, MAX_SCHEMA_ROWS)?;
    let response = conn.clone().issue(request).await.get().await?;
    Ok(response.data.unwrap_or_default())
}

fn build(space_rows: &[Value], index_rows: &[Value]) -> Result<Schema, ClientError> {
    let mut spaces: HashMap<u32, Space> = HashMap::new();
    for row in space_rows {
        let space = parse_space_row(row)?;
        spaces.insert(space.id, space);
    }

    for row in index_rows {
        let (space_id, index) = parse_index_row(row)?;
        let space = spaces.get_mut(&space_id).ok_or_else(|| {
            catalog(&format!(
                "index {} references unknown space {space_id}",
                index.name
            ))
        })?;
        let index = Arc::new(index);
        space.indexes_by_id.insert(index.id, index.clone());
        space.indexes.insert(index.name.clone(), index);
    }

    let mut schema = Schema::default();
    for (_, space) in spaces {
        let space = Arc::new(space);
        schema.spaces_by_id.insert(space.id, space.clone());
        schema.spaces.insert(space.name.clone(), space);
    }
    Ok(schema)
}

fn catalog(message: &str) -> ClientError {
    ClientError::Catalog(message.to_string())
}

fn uint_at(fields: &[Value], position: usize, what: &str) -> Result<u64, ClientError> {
    fields
        .get(position)
        .and_then(Value::as_u64)
        .ok_or_else(|| catalog(&format!("{what} at position {position} is not an unsigned integer")))
}

fn str_at<'a>(fields: &'a [Value], position: usize, what: &str) -> Result<&'a str, ClientError> {
    fields
        .get(position)
        .and_then(Value::as_str)
        .ok_or_else(|| catalog(&format!("{what} at position {position} is not a string")))
}

/// Decodes one `_vspace` row: id, owner, name, engine, field count, then
/// optional flags and an optional field format list.
fn parse_space_row(row: &Value) -> Result<Space, ClientError> {
    let fields = row
        .as_array()
        .ok_or_else(|| catalog("space row is not a tuple"))?;
    if fields.len() < 5 {
        return Err(catalog("space row has fewer than 5 fields"));
    }

    let mut space = Space {
        id: uint_at(fields, 0, "space id")? as u32,
        name: str_at(fields, 2, "space name")?.to_string(),
        engine: str_at(fields, 3, "space engine")?.to_string(),
        field_count: uint_at(fields, 4, "space field count")? as u32,
        ..Space::default()
    };

    // Flags: a legacy string tag or a structured options map.
    if let Some(flags) = fields.get(5) {
        match flags {
            Value::String(tag) => space.temporary = tag.as_str() == Some("temporary"),
            Value::Map(options) => {
                for (key, value) in options {
                    if key.as_str() == Some("temporary") {
                        space.temporary = value.as_bool().unwrap_or(false);
                    }
                }
            }
            Value::Nil => {}
            other => {
                return Err(catalog(&format!("unsupported space flags shape: {other:?}")))
            }
        }
    }

    // Field format list; entries may be nil or partial.
    if let Some(Value::Array(format)) = fields.get(6) {
        for (position, entry) in format.iter().enumerate() {
            let Value::Map(pairs) = entry else { continue };
            let mut field = Field {
                id: position as u32,
                ..Field::default()
            };
            for (key, value) in pairs {
                match key.as_str() {
                    Some("name") => field.name = value.as_str().unwrap_or_default().to_string(),
                    Some("type") => {
                        field.field_type = value.as_str().unwrap_or_default().to_string()
                    }
                    _ => {}
                }
            }
            if !field.name.is_empty() {
                space.fields.insert(field.name.clone(), field.clone());
            }
            space.fields_by_id.insert(field.id, field);
        }
    }

    Ok(space)
}

/// Decodes one `_vindex` row: space id, index id, name, kind, then the
/// uniqueness flag and part list, each of which has two accepted legacy
/// encodings.
fn parse_index_row(row: &Value) -> Result<(u32, Index), ClientError> {
    let fields = row
        .as_array()
        .ok_or_else(|| catalog("index row is not a tuple"))?;
    if fields.len() < 6 {
        return Err(catalog("index row has fewer than 6 fields"));
    }

    let space_id = uint_at(fields, 0, "index space id")? as u32;
    let mut index = Index {
        id: uint_at(fields, 1, "index id")? as u32,
        name: str_at(fields, 2, "index name")?.to_string(),
        kind: str_at(fields, 3, "index kind")?.to_string(),
        ..Index::default()
    };

    // Uniqueness: a legacy integer or a structured options map.
    match &fields[4] {
        Value::Integer(_) => index.unique = uint_at(fields, 4, "index opts")? > 0,
        Value::Map(options) => {
            for (key, value) in options {
                if key.as_str() == Some("unique") {
                    index.unique = value.as_bool().unwrap_or(false);
                }
            }
        }
        other => return Err(catalog(&format!("unsupported index opts shape: {other:?}"))),
    }

    // Parts: a count followed by inline field/type pairs, or a nested list
    // of [field, type] pairs.
    match &fields[5] {
        Value::Integer(_) => {
            let count = uint_at(fields, 5, "index part count")? as usize;
            for part in 0..count {
                index.parts.push(IndexPart {
                    field_no: uint_at(fields, 6 + part * 2, "index part field")? as u32,
                    field_type: str_at(fields, 7 + part * 2, "index part type")?.to_string(),
                });
            }
        }
        Value::Array(parts) => {
            for part in parts {
                let pair = part
                    .as_array()
                    .ok_or_else(|| catalog("index part is not a pair"))?;
                index.parts.push(IndexPart {
                    field_no: uint_at(pair, 0, "index part field")? as u32,
                    field_type: str_at(pair, 1, "index part type")?.to_string(),
                });
            }
        }
        other => return Err(catalog(&format!("unsupported index parts shape: {other:?}"))),
    }

    Ok((space_id, index))
}
