use std::path::{Path, PathBuf};

use flowfarm::naming::FrameNaming;

pub const FRAME_WIDTH: u32 = 48;
pub const FRAME_HEIGHT: u32 = 40;

fn pattern(x: f32, y: f32) -> f32 {
    128.0 + 60.0 * (x * 0.31).sin() * (y * 0.23).cos() + 40.0 * ((x + y) * 0.17).sin()
}

/// Write frame `idx` as a textured PPM drifting one pixel right per frame.
pub fn write_frame(dir: &Path, idx: u32) -> PathBuf {
    let path = FrameNaming::default().frame_path(dir, idx);
    let shift = idx as f32;
    let image = image::RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
        let level = pattern(x as f32 - shift, y as f32).clamp(0.0, 255.0) as u8;
        image::Rgb([level, level, level])
    });
    image.save(&path).unwrap();
    path
}

pub fn write_frames(dir: &Path, indices: impl IntoIterator<Item = u32>) {
    for idx in indices {
        write_frame(dir, idx);
    }
}

/// Executable `/bin/sh` script standing in for an external tool.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Checker stub that insists both flow files exist, then writes `$3`.
#[cfg(unix)]
pub fn write_checker(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "consistencyChecker",
        "test -f \"$1\" || exit 4\ntest -f \"$2\" || exit 5\nprintf 'P5\\n1 1\\n255\\n\\377' > \"$3\"",
    )
}

/// Sorted names of files in `dir` with the given extension.
pub fn files_with_extension(dir: &Path, extension: &str) -> Vec<String> {
    let mut names = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(&format!(".{extension}")))
        .collect::<Vec<_>>();
    names.sort();
    names
}
