use crate::rows::RowSet;
use crate::value::Value;

pub fn to_csv(rows: &RowSet) -> String {
    let mut output = String::new();

    let headers: Vec<String> = rows.columns().iter().map(|c| csv_escape(&c.name)).collect();
    output.push_str(&headers.join(","));
    output.push('\n');

    for row in rows {
        let cells: Vec<String> = row
            .values()
            .iter()
            .map(|cell| csv_escape(&cell_to_csv(cell)))
            .collect();
        output.push_str(&cells.join(","));
        output.push('\n');
    }

    output
}

pub fn to_json(rows: &RowSet) -> String {
    let rows_json: Vec<serde_json::Value> = rows.iter().map(|r| r.to_json()).collect();
    serde_json::to_string_pretty(&rows_json).unwrap_or_else(|_| "[]".to_string())
}

fn cell_to_csv(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::Json(j) => j.to_string(),
        other => other.display(),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::Column;
    use crate::schema::FieldType;

    fn make_rows() -> RowSet {
        RowSet::new(
            vec![
                Column {
                    name: "id".into(),
                    field_type: Some(FieldType::Id),
                },
                Column {
                    name: "name".into(),
                    field_type: Some(FieldType::Text),
                },
                Column {
                    name: "active".into(),
                    field_type: Some(FieldType::Boolean),
                },
            ],
            vec![
                vec![1.into(), "Alice".into(), true.into()],
                vec![2.into(), "Bob, Jr.".into(), Value::Null],
            ],
            Some("users".into()),
        )
    }

    #[test]
    fn test_csv_export() {
        let csv = to_csv(&make_rows());
        assert!(csv.starts_with("id,name,active\n"));
        assert!(csv.contains("1,Alice,true\n"));
        assert!(csv.contains("2,\"Bob, Jr.\",\n"));
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_escape("hello"), "hello");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_json_export() {
        let json = to_json(&make_rows());
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["id"], 1);
        assert_eq!(parsed[0]["active"], true);
        assert!(parsed[1]["active"].is_null());
    }
}
