pub(super) const ROOT_LONG_ABOUT: &str = "\
Media-library custodian: fingerprints, backups, and duplicate handling

Medorg maintains a .medorg.xml sidecar in every directory it manages, recording
each file's size, modification time, and MD5 content fingerprint along with
free-form tags and the set of backup volumes known to hold the content. The
sidecars drive every other operation - backups know what already made it to a
volume, discovery recognizes content that was copied by hand, and duplicate
detection compares fingerprints instead of re-reading files.

CORE CONCEPTS:

  .medorg.xml sidecars:
    Per-directory metadata describing that directory's immediate files. The
    non-recursive model means a directory can move as a self-contained unit.

  Volume labels:
    Every backup destination carries a .mdbackup.xml at its root with a stable
    random 8-letter label. Source records name volumes by label, so a volume
    keeps its identity across remounts and path changes.

  Skipping:
    Hidden directories (any path component starting with '.') are never
    walked. A .mdSkipDir file in a directory excludes its whole subtree.

TYPICAL WORKFLOW:

  1. Fingerprint a media tree:
     $ medorg check ~/media

  2. Back it up to an external drive:
     $ medorg backup ~/media /mnt/external

  3. Later, prune files on the drive that no longer exist at home:
     $ medorg backup --delete-orphans ~/media /mnt/external

  4. Find and clean up duplicates:
     $ medorg dupes ~/media
     $ medorg autofix --rename --delete-dupes ~/media
";

pub(super) const CHECK_LONG_ABOUT: &str = "\
Bring sidecar checksums up to date for one or more trees

Walks each directory, creating records for new files and refreshing records
whose size or modification time changed. Files with stale metadata get a fresh
fingerprint; unchanged files are not re-read.

With --validate every file is re-read and its fingerprint compared against the
sidecar. A mismatch means the content changed behind medorg's back (or the
storage is rotting): the new fingerprint is stored, the file's backup
destinations are cleared, and the drift is reported.";

pub(super) const BACKUP_LONG_ABOUT: &str = "\
Replicate source trees onto a destination volume

The last path is the destination; every path before it is a source. The
destination's volume label is discovered from its .mdbackup.xml, or minted and
registered in the global config on first use.

Content already present on the destination (by size and fingerprint) is not
copied again - the source record is just tagged with the volume label.
Identical content under several source paths is copied once.

Files on the destination that no source explains are orphans. By default they
are only reported; --delete-orphans removes them. A file matching any source
is never treated as an orphan, no matter which source it came from.";

pub(super) const DISCOVER_LONG_ABOUT: &str = "\
Tag source records whose content already exists on a labeled volume

For backups that were made by hand: walks the volume, indexes its sidecars by
content fingerprint, and tags every source record whose content the volume
already holds. No files are copied and no labels are minted - the volume must
already carry a .mdbackup.xml.";

pub(super) const DUPES_LONG_ABOUT: &str = "\
Report files with identical content

Builds a fingerprint index over one or two trees and prints every group of
paths sharing a (size, fingerprint) pair. Sidecars are updated as a side
effect, so a second run is fast.

A fingerprint seen with two different sizes is reported as a collision and
never merged.";

pub(super) const TAG_LONG_ABOUT: &str = "\
Add or remove tags on files in one directory

Tags are free-form strings stored in the directory's sidecar; medorg never
interprets them. Tagging a file that has no sidecar record yet creates one
from a stat - run 'medorg check' afterwards to fingerprint it.";

pub(super) const AUTOFIX_LONG_ABOUT: &str = "\
Apply filename rules and prune duplicates

--rename runs the configured rewrite rules over every file with a recognized
media extension: regex rules from the global config rewrite the base name,
doubled extensions and (n) copy counters are stripped, and runs of dots and
spaces collapse. When the cleaned name is taken, the smallest free (i) suffix
is used.

--delete-dupes keeps the best-scoring copy of each duplicated content and
deletes the rest. Scoring prefers deeper directories and 'favs' components,
and penalizes 'to' components and longer filenames.";
