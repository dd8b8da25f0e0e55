pub const SCHEMA: &str = r#"
-- Photos table: metadata recorded by the probe
CREATE TABLE IF NOT EXISTS photos (
    path TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    directory TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_at TEXT,
    width INTEGER,
    height INTEGER,
    format TEXT,
    orientation INTEGER NOT NULL DEFAULT 1,  -- EXIF orientation 1-8
    taken_at TEXT,
    scanned_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_photos_directory ON photos(directory);

-- Persistent thumbnail tier, keyed by the cache key digest
CREATE TABLE IF NOT EXISTS thumbnails (
    key_digest TEXT PRIMARY KEY,
    source_path TEXT NOT NULL,         -- Normalized path of the originating image
    height INTEGER NOT NULL,
    data BLOB NOT NULL,                -- Encoded image bytes (JPEG or PNG)
    source_fingerprint TEXT NOT NULL,  -- size + mtime of the source when generated
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_thumbnails_source_path ON thumbnails(source_path);
"#;
