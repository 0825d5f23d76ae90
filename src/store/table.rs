use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Columnar table of `f64` measurements keyed by a numeric index
/// (`frequency` for every calibration artifact).
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    index_name: String,
    index: Vec<f64>,
    columns: Vec<(String, Vec<f64>)>,
}

impl Table {
    pub fn new(index_name: impl Into<String>, index: Vec<f64>) -> Self {
        Self {
            index_name: index_name.into(),
            index,
            columns: Vec::new(),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn index(&self) -> &[f64] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Add or replace a column; its length must match the index
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.index.len() {
            bail!(
                "Column {} has {} rows, index has {}",
                name,
                values.len(),
                self.index.len()
            );
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = values,
            None => self.columns.push((name, values)),
        }
        Ok(())
    }

    /// Builder form of [`Table::insert`] for call sites that construct rows in lock-step
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.insert(name, values)?;
        Ok(self)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        if name == self.index_name {
            return Some(&self.index);
        }
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Fill every row of a column with one value
    pub fn broadcast(&mut self, name: impl Into<String>, value: f64) -> Result<()> {
        let n = self.len();
        self.insert(name, vec![value; n])
    }

    /// Keep the rows where `keep` is true
    pub fn filter_rows(&self, keep: &[bool]) -> Table {
        let pick = |values: &[f64]| {
            values
                .iter()
                .zip(keep.iter())
                .filter(|(_, k)| **k)
                .map(|(v, _)| *v)
                .collect::<Vec<f64>>()
        };
        Table {
            index_name: self.index_name.clone(),
            index: pick(&self.index),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), pick(values)))
                .collect(),
        }
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        self.write_csv_with_key(writer, None)
    }

    fn write_csv_with_key<W: Write>(&self, writer: W, key: Option<(&str, &str)>) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        self.write_records(&mut wtr, key, true)?;
        wtr.flush()?;
        Ok(())
    }

    fn write_records<W: Write>(
        &self,
        wtr: &mut csv::Writer<W>,
        key: Option<(&str, &str)>,
        header: bool,
    ) -> Result<()> {
        if header {
            let mut names: Vec<&str> = Vec::new();
            if let Some((key_name, _)) = key {
                names.push(key_name);
            }
            names.push(&self.index_name);
            names.extend(self.column_names());
            wtr.write_record(&names)?;
        }
        for row in 0..self.len() {
            let mut record: Vec<String> = Vec::with_capacity(self.columns.len() + 2);
            if let Some((_, key_value)) = key {
                record.push(key_value.to_string());
            }
            // `Display` for f64 is the shortest representation that parses back exactly
            record.push(self.index[row].to_string());
            for (_, values) in &self.columns {
                record.push(values[row].to_string());
            }
            wtr.write_record(&record)?;
        }
        Ok(())
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Table> {
        let mut tables = read_keyed(reader, false)?;
        tables
            .remove("")
            .ok_or_else(|| anyhow!("CSV contained no table"))
    }
}

fn parse_cell(cell: &str) -> Result<f64> {
    cell.trim()
        .parse::<f64>()
        .with_context(|| format!("Invalid numeric cell {:?}", cell))
}

fn read_keyed<R: Read>(reader: R, keyed: bool) -> Result<BTreeMap<String, Table>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let skip = usize::from(keyed);
    if headers.len() < 1 + skip {
        bail!("CSV header is missing the index column");
    }
    let index_name = headers[skip].to_string();
    let column_names: Vec<String> = headers.iter().skip(skip + 1).map(String::from).collect();

    let mut tables: BTreeMap<String, (Vec<f64>, Vec<Vec<f64>>)> = BTreeMap::new();
    for record in rdr.records() {
        let record = record?;
        let key = if keyed { record[0].to_string() } else { String::new() };
        let (index, columns) = tables
            .entry(key)
            .or_insert_with(|| (Vec::new(), vec![Vec::new(); column_names.len()]));
        index.push(parse_cell(&record[skip])?);
        for (i, column) in columns.iter_mut().enumerate() {
            column.push(parse_cell(&record[skip + 1 + i])?);
        }
    }
    if tables.is_empty() && !keyed {
        tables.insert(String::new(), (Vec::new(), vec![Vec::new(); column_names.len()]));
    }

    Ok(tables
        .into_iter()
        .map(|(key, (index, columns))| {
            let table = Table {
                index_name: index_name.clone(),
                index,
                columns: column_names.iter().cloned().zip(columns).collect(),
            };
            (key, table)
        })
        .collect())
}

/// Named CSV tables under one directory (`<root>/<name>.csv`).
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    /// Creates the storage directory if it doesn't exist
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create table storage directory")?;
        Ok(Self { root })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.csv", name))
    }

    pub fn save(&self, name: &str, table: &Table) -> Result<PathBuf> {
        let path = self.path(name);
        let file = fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        table.write_csv(file)?;
        tracing::debug!(name, rows = table.len(), "saved table");
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<Table> {
        let path = self.path(name);
        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Table::read_csv(file)
    }

    /// Save per-channel tables in one file with a leading `channel` column
    pub fn save_merged(&self, name: &str, tables: &BTreeMap<String, Table>) -> Result<PathBuf> {
        let path = self.path(name);
        let file = fs::File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut wtr = csv::Writer::from_writer(file);
        for (i, (channel, table)) in tables.iter().enumerate() {
            table.write_records(&mut wtr, Some(("channel", channel)), i == 0)?;
        }
        wtr.flush()?;
        Ok(path)
    }

    pub fn load_merged(&self, name: &str) -> Result<BTreeMap<String, Table>> {
        let path = self.path(name);
        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        read_keyed(file, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new("frequency", vec![1000.0, 2000.0, 4000.0])
            .with_column("sens", vec![-40.0, -42.125, f64::NAN])
            .unwrap()
            .with_column("snr", vec![0.1 + 0.2, 1e-300, f64::INFINITY])
            .unwrap()
    }

    fn same(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits() || (x.is_nan() && y.is_nan()))
    }

    #[test]
    fn test_csv_roundtrip_is_lossless() {
        let table = sample();
        let mut buffer = Vec::new();
        table.write_csv(&mut buffer).unwrap();
        let back = Table::read_csv(buffer.as_slice()).unwrap();

        assert_eq!(back.index_name(), "frequency");
        assert_eq!(back.column_names(), vec!["sens", "snr"]);
        assert!(same(back.column("sens").unwrap(), table.column("sens").unwrap()));
        assert!(same(back.column("snr").unwrap(), table.column("snr").unwrap()));
    }

    #[test]
    fn test_insert_rejects_wrong_length() {
        let mut table = Table::new("frequency", vec![1.0, 2.0]);
        assert!(table.insert("x", vec![1.0]).is_err());
    }

    #[test]
    fn test_filter_rows() {
        let table = sample().filter_rows(&[true, false, true]);
        assert_eq!(table.index(), &[1000.0, 4000.0]);
        assert_eq!(table.column("sens").unwrap()[0], -40.0);
    }
}
